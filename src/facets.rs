//! # Faceted filter compiler
//!
//! Compiles a field-to-specification mapping into a predicate evaluable
//! against a stored metadata JSON blob, plus an equivalent SQL fragment for
//! pushdown over `json_extract(metadata, '$.<field>')`. Generalizes the
//! single-field `FilterPredicate::{Equals,And,Or}` pattern to the full
//! operator set, JSON-scalar values, and `NOT`.

use std::fmt::Write as _;

use serde_json::Value;

use crate::error::{Result, StoreError};

/// A JSON-scalar value usable on the right-hand side of a filter.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterValue {
    String(String),
    Number(f64),
    Bool(bool),
}

impl FilterValue {
    fn matches_json(&self, value: &Value) -> bool {
        match (self, value) {
            (FilterValue::String(s), Value::String(v)) => s == v,
            (FilterValue::Number(n), Value::Number(v)) => v.as_f64() == Some(*n),
            (FilterValue::Bool(b), Value::Bool(v)) => b == v,
            _ => false,
        }
    }

    fn to_sql_literal(&self) -> String {
        match self {
            FilterValue::String(s) => format!("'{}'", s.replace('\'', "''")),
            FilterValue::Number(n) => n.to_string(),
            FilterValue::Bool(b) => if *b { "1".to_string() } else { "0".to_string() },
        }
    }
}

/// How [`FilterSpec::Nested`] children are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    /// Logical complement of its single child. Compiling a `Not` node with
    /// more or fewer than one child is an [`StoreError::InvalidArgument`].
    Not,
}

/// One filter specification, keyed by field name at the call site (see
/// [`FacetFilter`]) except inside [`FilterSpec::Nested`], which carries its
/// own field names for its children.
#[derive(Clone, Debug)]
pub enum FilterSpec {
    Equals(FilterValue),
    In(Vec<FilterValue>),
    Range { min: Option<f64>, max: Option<f64> },
    Contains(String),
    Prefix(String),
    Exists,
    Nested {
        children: Vec<(String, FilterSpec)>,
        op: LogicalOp,
    },
}

/// A mapping from field name to filter specification. Entries are combined
/// with AND, mirroring the relational-query convention of ANDing a WHERE
/// clause's top-level conjuncts.
pub type FacetFilter = Vec<(String, FilterSpec)>;

/// A filter compiled once and reusable across candidate rows.
pub struct CompiledFilter {
    entries: FacetFilter,
    sql: String,
}

impl CompiledFilter {
    /// Compile `filter`, validating every [`LogicalOp::Not`] node has
    /// exactly one child.
    pub fn compile(filter: FacetFilter) -> Result<Self> {
        let mut sql = String::new();
        for (i, (field, spec)) in filter.iter().enumerate() {
            if i > 0 {
                sql.push_str(" AND ");
            }
            write_sql(&mut sql, field, spec)?;
        }
        Ok(Self { entries: filter, sql })
    }

    /// An always-true filter with an empty SQL fragment.
    pub fn none() -> Self {
        Self {
            entries: Vec::new(),
            sql: String::new(),
        }
    }

    /// Evaluate against a parsed metadata object. Fields absent from
    /// `metadata` evaluate every leaf operator as `false`, including
    /// `Exists`.
    pub fn evaluate(&self, metadata: &Value) -> bool {
        self.entries
            .iter()
            .all(|(field, spec)| evaluate_spec(field, spec, metadata))
    }

    /// The compiled `json_extract` SQL fragment, suitable for a `WHERE`
    /// clause. Empty when no fields were supplied.
    pub fn sql_fragment(&self) -> &str {
        &self.sql
    }
}

fn evaluate_spec(field: &str, spec: &FilterSpec, metadata: &Value) -> bool {
    let field_value = metadata.get(field);
    match spec {
        FilterSpec::Equals(v) => field_value.is_some_and(|fv| v.matches_json(fv)),
        FilterSpec::In(values) => {
            field_value.is_some_and(|fv| values.iter().any(|v| v.matches_json(fv)))
        }
        FilterSpec::Range { min, max } => field_value
            .and_then(Value::as_f64)
            .is_some_and(|n| min.is_none_or(|m| n >= m) && max.is_none_or(|m| n <= m)),
        FilterSpec::Contains(pattern) => field_value
            .and_then(Value::as_str)
            .is_some_and(|s| s.contains(pattern.as_str())),
        FilterSpec::Prefix(pattern) => field_value
            .and_then(Value::as_str)
            .is_some_and(|s| s.starts_with(pattern.as_str())),
        FilterSpec::Exists => field_value.is_some(),
        FilterSpec::Nested { children, op } => match op {
            LogicalOp::And => children.iter().all(|(f, s)| evaluate_spec(f, s, metadata)),
            LogicalOp::Or => children.iter().any(|(f, s)| evaluate_spec(f, s, metadata)),
            LogicalOp::Not => {
                let (f, s) = &children[0];
                !evaluate_spec(f, s, metadata)
            }
        },
    }
}

fn write_sql(out: &mut String, field: &str, spec: &FilterSpec) -> Result<()> {
    let accessor = format!("json_extract(metadata, '$.{field}')");
    match spec {
        FilterSpec::Equals(v) => {
            let _ = write!(out, "{accessor} = {}", v.to_sql_literal());
        }
        FilterSpec::In(values) => {
            let list: Vec<String> = values.iter().map(FilterValue::to_sql_literal).collect();
            let _ = write!(out, "{accessor} IN ({})", list.join(", "));
        }
        FilterSpec::Range { min, max } => {
            let cast = format!("CAST({accessor} AS REAL)");
            match (min, max) {
                (Some(lo), Some(hi)) => {
                    let _ = write!(out, "{cast} BETWEEN {lo} AND {hi}");
                }
                (Some(lo), None) => {
                    let _ = write!(out, "{cast} >= {lo}");
                }
                (None, Some(hi)) => {
                    let _ = write!(out, "{cast} <= {hi}");
                }
                (None, None) => {
                    let _ = write!(out, "{accessor} IS NOT NULL");
                }
            }
        }
        FilterSpec::Contains(pattern) => {
            let escaped = pattern.replace('\'', "''");
            let _ = write!(out, "{accessor} LIKE '%{escaped}%'");
        }
        FilterSpec::Prefix(pattern) => {
            let escaped = pattern.replace('\'', "''");
            let _ = write!(out, "{accessor} LIKE '{escaped}%'");
        }
        FilterSpec::Exists => {
            let _ = write!(out, "{accessor} IS NOT NULL");
        }
        FilterSpec::Nested { children, op } => {
            if matches!(op, LogicalOp::Not) && children.len() != 1 {
                return Err(StoreError::invalid(
                    "compile_filter",
                    format!("Not requires exactly one child, got {}", children.len()),
                ));
            }
            let joiner = match op {
                LogicalOp::And => " AND ",
                LogicalOp::Or => " OR ",
                LogicalOp::Not => "",
            };
            if matches!(op, LogicalOp::Not) {
                let (f, s) = &children[0];
                out.push_str("NOT (");
                write_sql(out, f, s)?;
                out.push(')');
            } else {
                out.push('(');
                for (i, (f, s)) in children.iter().enumerate() {
                    if i > 0 {
                        out.push_str(joiner);
                    }
                    write_sql(out, f, s)?;
                }
                out.push(')');
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equals_matches_exact_value() {
        let filter = CompiledFilter::compile(vec![(
            "category".to_string(),
            FilterSpec::Equals(FilterValue::String("tech".to_string())),
        )])
        .unwrap();
        assert!(filter.evaluate(&json!({"category": "tech"})));
        assert!(!filter.evaluate(&json!({"category": "science"})));
    }

    #[test]
    fn missing_field_is_false_for_every_leaf_including_exists() {
        let metadata = json!({"other": 1});
        for spec in [
            FilterSpec::Equals(FilterValue::Number(1.0)),
            FilterSpec::In(vec![FilterValue::Number(1.0)]),
            FilterSpec::Range { min: Some(0.0), max: Some(1.0) },
            FilterSpec::Contains("x".to_string()),
            FilterSpec::Prefix("x".to_string()),
            FilterSpec::Exists,
        ] {
            assert!(!evaluate_spec("missing", &spec, &metadata));
        }
    }

    #[test]
    fn range_is_inclusive_on_both_ends() {
        let filter = CompiledFilter::compile(vec![(
            "score".to_string(),
            FilterSpec::Range { min: Some(1.0), max: Some(3.0) },
        )])
        .unwrap();
        assert!(filter.evaluate(&json!({"score": 1.0})));
        assert!(filter.evaluate(&json!({"score": 3.0})));
        assert!(!filter.evaluate(&json!({"score": 3.1})));
    }

    #[test]
    fn nested_and_or_not_compose() {
        let filter = CompiledFilter::compile(vec![(
            "_".to_string(),
            FilterSpec::Nested {
                children: vec![
                    ("category".to_string(), FilterSpec::Equals(FilterValue::String("tech".into()))),
                    (
                        "_".to_string(),
                        FilterSpec::Nested {
                            children: vec![(
                                "archived".to_string(),
                                FilterSpec::Equals(FilterValue::Bool(true)),
                            )],
                            op: LogicalOp::Not,
                        },
                    ),
                ],
                op: LogicalOp::And,
            },
        )])
        .unwrap();

        assert!(filter.evaluate(&json!({"category": "tech", "archived": false})));
        assert!(!filter.evaluate(&json!({"category": "tech", "archived": true})));
    }

    #[test]
    fn not_requires_exactly_one_child() {
        let err = CompiledFilter::compile(vec![(
            "_".to_string(),
            FilterSpec::Nested {
                children: vec![],
                op: LogicalOp::Not,
            },
        )])
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument { .. }));
    }

    #[test]
    fn sql_fragment_uses_json_extract() {
        let filter = CompiledFilter::compile(vec![(
            "category".to_string(),
            FilterSpec::Equals(FilterValue::String("tech".to_string())),
        )])
        .unwrap();
        assert_eq!(
            filter.sql_fragment(),
            "json_extract(metadata, '$.category') = 'tech'"
        );
    }

    #[test]
    fn prefix_and_contains_match_substrings() {
        let metadata = json!({"title": "hello world"});
        assert!(evaluate_spec("title", &FilterSpec::Prefix("hello".into()), &metadata));
        assert!(evaluate_spec("title", &FilterSpec::Contains("lo wo".into()), &metadata));
        assert!(!evaluate_spec("title", &FilterSpec::Prefix("world".into()), &metadata));
    }
}
