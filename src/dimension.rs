//! # Dimension adaptation
//!
//! Reshapes a vector of native length `S` into a vector of target length `T`
//! under a configured [`DimensionPolicy`], then renormalizes so cosine/dot
//! scores stay commensurable across adapted inputs.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Policy governing how a source vector's length is reconciled with a
/// collection's target dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimensionPolicy {
    /// Truncate if `S > T`; right-pad with zeros if `S < T`; identity if
    /// `S == T`.
    SmartAdapt,
    /// Truncate if `S > T`; fail with [`StoreError::DimensionMismatch`] if
    /// `S < T`.
    AutoTruncate,
    /// Pad with zeros if `S < T`; fail with [`StoreError::DimensionMismatch`]
    /// if `S > T`.
    AutoPad,
    /// Never reshape; fail on any `S != T`.
    WarnOnly,
}

impl Default for DimensionPolicy {
    fn default() -> Self {
        DimensionPolicy::SmartAdapt
    }
}

/// Adapt `source` (native length `S`) to `target_dim` (`T`) under `policy`,
/// then L2-renormalize unless `normalize` is `false` or the input is the
/// zero vector.
///
/// `op` is the operation name to attach to any [`StoreError::DimensionMismatch`].
pub fn adapt_vector(
    source: &[f32],
    target_dim: usize,
    policy: DimensionPolicy,
    normalize: bool,
    op: &'static str,
) -> Result<Vec<f32>> {
    let s = source.len();
    let t = target_dim;

    let reshaped = match policy {
        DimensionPolicy::SmartAdapt => smart_adapt(source, t),
        DimensionPolicy::AutoTruncate => {
            if s < t {
                return Err(StoreError::DimensionMismatch {
                    op,
                    expected: t,
                    actual: s,
                });
            }
            smart_adapt(source, t)
        }
        DimensionPolicy::AutoPad => {
            if s > t {
                return Err(StoreError::DimensionMismatch {
                    op,
                    expected: t,
                    actual: s,
                });
            }
            smart_adapt(source, t)
        }
        DimensionPolicy::WarnOnly => {
            if s != t {
                tracing::warn!(
                    expected = t,
                    actual = s,
                    "WarnOnly dimension policy rejected a vector"
                );
                return Err(StoreError::DimensionMismatch {
                    op,
                    expected: t,
                    actual: s,
                });
            }
            source.to_vec()
        }
    };

    if normalize {
        Ok(renormalize(reshaped))
    } else {
        Ok(reshaped)
    }
}

/// Truncate if longer, zero-pad if shorter, identity if equal.
fn smart_adapt(source: &[f32], target_dim: usize) -> Vec<f32> {
    match source.len().cmp(&target_dim) {
        std::cmp::Ordering::Equal => source.to_vec(),
        std::cmp::Ordering::Greater => source[..target_dim].to_vec(),
        std::cmp::Ordering::Less => {
            let mut v = source.to_vec();
            v.resize(target_dim, 0.0);
            v
        }
    }
}

/// Re-scale so the sum of squares equals `1.0`. The zero vector is returned
/// unchanged (there is nothing to normalize).
fn renormalize(v: Vec<f32>) -> Vec<f32> {
    let sum_sq: f32 = v.iter().map(|x| x * x).sum();
    if sum_sq == 0.0 {
        return v;
    }
    let norm = sum_sq.sqrt();
    v.into_iter().map(|x| x / norm).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_adapt_truncates() {
        let v = adapt_vector(&[1.0, 2.0, 3.0, 4.0], 2, DimensionPolicy::SmartAdapt, false, "t")
            .unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
    }

    #[test]
    fn smart_adapt_pads() {
        let v = adapt_vector(&[1.0, 2.0], 4, DimensionPolicy::SmartAdapt, false, "t").unwrap();
        assert_eq!(v, vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn smart_adapt_identity() {
        let v = adapt_vector(&[1.0, 2.0], 2, DimensionPolicy::SmartAdapt, false, "t").unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
    }

    #[test]
    fn auto_truncate_fails_on_short_input() {
        let err = adapt_vector(&[1.0], 3, DimensionPolicy::AutoTruncate, false, "t").unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    }

    #[test]
    fn auto_truncate_truncates_long_input() {
        let v =
            adapt_vector(&[1.0, 2.0, 3.0], 2, DimensionPolicy::AutoTruncate, false, "t").unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
    }

    #[test]
    fn auto_pad_fails_on_long_input() {
        let err = adapt_vector(&[1.0, 2.0, 3.0], 2, DimensionPolicy::AutoPad, false, "t")
            .unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
    }

    #[test]
    fn auto_pad_pads_short_input() {
        let v = adapt_vector(&[1.0], 3, DimensionPolicy::AutoPad, false, "t").unwrap();
        assert_eq!(v, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn warn_only_rejects_any_mismatch() {
        let err = adapt_vector(&[1.0, 2.0], 3, DimensionPolicy::WarnOnly, false, "t").unwrap_err();
        assert!(matches!(err, StoreError::DimensionMismatch { .. }));
        let v = adapt_vector(&[1.0, 2.0], 2, DimensionPolicy::WarnOnly, false, "t").unwrap();
        assert_eq!(v, vec![1.0, 2.0]);
    }

    #[test]
    fn renormalize_scales_to_unit_norm() {
        let v = adapt_vector(&[3.0, 4.0], 2, DimensionPolicy::SmartAdapt, true, "t").unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn renormalize_leaves_zero_vector_unchanged() {
        let v = adapt_vector(&[0.0, 0.0], 2, DimensionPolicy::SmartAdapt, true, "t").unwrap();
        assert_eq!(v, vec![0.0, 0.0]);
    }

    #[test]
    fn padding_extends_shorter_vector_with_zeros() {
        let v = adapt_vector(&[0.7, 0.7], 3, DimensionPolicy::SmartAdapt, false, "t").unwrap();
        assert_eq!(v, vec![0.7, 0.7, 0.0]);
    }
}
