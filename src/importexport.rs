//! # Import / export
//!
//! Deterministic serialization of a [`crate::store::Store`] into a
//! streamable archive for backup and migration: `JSON` (one envelope object)
//! or `JSONL` (one embedding per line), each optionally gzip-compressed the
//! way `flate2::write::GzEncoder` is used elsewhere in this crate's
//! reference corpus for streaming compressed output.

use std::io::{BufRead, Read, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::cancellation::CancellationToken;
use crate::error::{Result, StoreError};
use crate::facets::FilterSpec;
use crate::store::{NewEmbedding, Store};

const CANCEL_CHECK_STRIDE: usize = 1024;

/// One embedding as it appears in a dump.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DumpedEmbedding {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub collection: String,
}

/// Envelope metadata for the `JSON` dump format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DumpMetadata {
    pub version: String,
    pub dimensions: usize,
    pub count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The full `JSON` dump envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DumpEnvelope {
    pub metadata: DumpMetadata,
    pub embeddings: Vec<DumpedEmbedding>,
}

/// Options controlling what a dump includes.
#[derive(Clone, Debug, Default)]
pub struct DumpOptions {
    pub include_vectors: bool,
    pub include_metadata: bool,
    pub filter: Option<Vec<(String, FilterSpec)>>,
    pub collection_id: Option<i32>,
    pub gzip: bool,
}

/// How a dump should be framed on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DumpFormat {
    Json,
    Jsonl,
}

/// Options controlling [`load`]'s conflict handling.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    /// Ids already present in the store are skipped and counted.
    pub skip_existing: bool,
    /// Always replace an existing id (mutually exclusive in effect with
    /// `skip_existing`; `skip_existing` takes precedence if both are set).
    /// When both are `false` (the default), an id already present in the
    /// store is rejected and counted in `Stats::error_count` rather than
    /// being silently overwritten.
    pub overwrite: bool,
    /// Validate without writing.
    pub dry_run: bool,
    pub collection_id: Option<i32>,
}

/// Result counters for a dump or load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_embeddings: usize,
    pub skipped_count: usize,
    pub error_count: usize,
}

fn collect_embeddings(
    store: &Store,
    opts: &DumpOptions,
    cancel: &CancellationToken,
) -> Result<Vec<DumpedEmbedding>> {
    let rows = store.iterate(opts.collection_id, opts.filter.clone(), cancel)?;
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.into_iter().enumerate() {
        if i % CANCEL_CHECK_STRIDE == 0 {
            cancel.check("dump")?;
        }
        let collection = store.collection_name(row.collection_id)?;
        out.push(DumpedEmbedding {
            id: row.id,
            vector: opts.include_vectors.then_some(row.vector),
            content: row.content,
            metadata: opts.include_metadata.then_some(row.metadata),
            collection,
        });
    }
    Ok(out)
}

fn wrap_writer(writer: impl Write + 'static, gzip: bool) -> Box<dyn Write> {
    if gzip {
        Box::new(GzEncoder::new(writer, Compression::default()))
    } else {
        Box::new(writer)
    }
}

/// Dump a store as a single `JSON` envelope object:
/// `{"metadata": {...}, "embeddings": [...]}`.
pub fn dump_json(
    store: &Store,
    writer: impl Write + 'static,
    opts: &DumpOptions,
    cancel: &CancellationToken,
) -> Result<Stats> {
    let embeddings = collect_embeddings(store, opts, cancel)?;
    let dim = embeddings
        .first()
        .and_then(|e| e.vector.as_ref())
        .map(|v| v.len())
        .unwrap_or(0);
    let envelope = DumpEnvelope {
        metadata: DumpMetadata {
            version: "1.0".to_string(),
            dimensions: dim,
            count: embeddings.len(),
            created_at: chrono::Utc::now(),
        },
        embeddings: embeddings.clone(),
    };

    let mut out = wrap_writer(writer, opts.gzip);
    serde_json::to_writer(&mut out, &envelope).map_err(|e| StoreError::internal("dump", e))?;
    out.flush().map_err(|e| StoreError::internal("dump", e))?;

    Ok(Stats {
        total_embeddings: embeddings.len(),
        skipped_count: 0,
        error_count: 0,
    })
}

/// Dump a store as line-delimited JSON, one [`DumpedEmbedding`] per line,
/// no envelope.
pub fn dump_jsonl(
    store: &Store,
    writer: impl Write + 'static,
    opts: &DumpOptions,
    cancel: &CancellationToken,
) -> Result<Stats> {
    let embeddings = collect_embeddings(store, opts, cancel)?;
    let mut out = wrap_writer(writer, opts.gzip);
    for (i, embedding) in embeddings.iter().enumerate() {
        if i % CANCEL_CHECK_STRIDE == 0 {
            cancel.check("dump")?;
        }
        serde_json::to_writer(&mut out, embedding).map_err(|e| StoreError::internal("dump", e))?;
        out.write_all(b"\n").map_err(|e| StoreError::internal("dump", e))?;
    }
    out.flush().map_err(|e| StoreError::internal("dump", e))?;

    Ok(Stats {
        total_embeddings: embeddings.len(),
        skipped_count: 0,
        error_count: 0,
    })
}

/// Read embeddings in `format` from `reader` and upsert them into `store`.
/// Dimension mismatches are handled per the store's configured adapter
/// policy; any other per-row failure is counted in [`Stats::error_count`]
/// without aborting the remaining rows.
pub fn load(
    store: &Store,
    reader: impl Read,
    format: DumpFormat,
    opts: &LoadOptions,
    cancel: &CancellationToken,
) -> Result<Stats> {
    let embeddings = match format {
        DumpFormat::Json => {
            let envelope: DumpEnvelope =
                serde_json::from_reader(reader).map_err(|e| StoreError::corrupted("load", e.to_string()))?;
            envelope.embeddings
        }
        DumpFormat::Jsonl => {
            let mut out = Vec::new();
            for line in std::io::BufReader::new(reader).lines() {
                let line = line.map_err(|e| StoreError::internal("load", e))?;
                if line.trim().is_empty() {
                    continue;
                }
                let embedding: DumpedEmbedding =
                    serde_json::from_str(&line).map_err(|e| StoreError::corrupted("load", e.to_string()))?;
                out.push(embedding);
            }
            out
        }
    };

    let mut stats = Stats {
        total_embeddings: embeddings.len(),
        ..Default::default()
    };

    for (i, embedding) in embeddings.into_iter().enumerate() {
        if i % CANCEL_CHECK_STRIDE == 0 {
            cancel.check("load")?;
        }

        // `skip_existing` takes precedence per `LoadOptions::overwrite`'s
        // doc comment; when neither flag is set, an existing id is rejected
        // rather than silently clobbered (the only case `Store::upsert`'s
        // unconditional on-conflict-replace can't express on its own).
        if opts.skip_existing || !opts.overwrite {
            match store.get_by_id(&embedding.id, cancel) {
                Ok(_) if opts.skip_existing => {
                    stats.skipped_count += 1;
                    continue;
                }
                Ok(_) => {
                    stats.error_count += 1;
                    continue;
                }
                Err(StoreError::NotFound { .. }) => {}
                Err(e) => {
                    stats.error_count += 1;
                    return Err(e);
                }
            }
        }

        if opts.dry_run {
            continue;
        }

        let Some(vector) = embedding.vector else {
            stats.error_count += 1;
            continue;
        };

        let mut new_embedding = NewEmbedding::new(embedding.id, vector, embedding.content);
        new_embedding.metadata = embedding.metadata.unwrap_or_else(|| serde_json::json!({}));
        if let Some(collection_id) = opts.collection_id {
            new_embedding.collection_id = collection_id;
        }

        if let Err(e) = store.upsert(new_embedding, cancel) {
            stats.error_count += 1;
            if !matches!(e, StoreError::DimensionMismatch { .. }) {
                return Err(e);
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> Store {
        let store = Store::new(":memory:", 3);
        store.init(&CancellationToken::none()).unwrap();
        let cancel = CancellationToken::none();
        store
            .upsert(
                {
                    let mut e = NewEmbedding::new("tech1", vec![1.0, 0.0, 0.0], "rust");
                    e.metadata = serde_json::json!({"category": "tech"});
                    e
                },
                &cancel,
            )
            .unwrap();
        store
            .upsert(
                {
                    let mut e = NewEmbedding::new("sci1", vec![0.0, 1.0, 0.0], "physics");
                    e.metadata = serde_json::json!({"category": "science"});
                    e
                },
                &cancel,
            )
            .unwrap();
        store
    }

    #[test]
    fn dump_json_filtered_by_category_writes_exactly_one() {
        let store = seeded_store();
        let opts = DumpOptions {
            include_vectors: true,
            include_metadata: true,
            filter: Some(vec![(
                "category".to_string(),
                FilterSpec::Equals(crate::facets::FilterValue::String("tech".to_string())),
            )]),
            collection_id: None,
            gzip: false,
        };
        let mut buf = Vec::new();
        let stats = dump_json(&store, std::io::Cursor::new(&mut buf), &opts, &CancellationToken::none()).unwrap();
        assert_eq!(stats.total_embeddings, 1);

        let envelope: DumpEnvelope = serde_json::from_slice(&buf).unwrap();
        assert_eq!(envelope.embeddings.len(), 1);
        assert_eq!(envelope.embeddings[0].id, "tech1");
    }

    #[test]
    fn dump_jsonl_emits_one_object_per_line() {
        let store = seeded_store();
        let opts = DumpOptions {
            include_vectors: true,
            include_metadata: true,
            filter: None,
            collection_id: None,
            gzip: false,
        };
        let mut buf = Vec::new();
        dump_jsonl(&store, std::io::Cursor::new(&mut buf), &opts, &CancellationToken::none()).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn load_with_skip_existing_counts_the_duplicate() {
        let store = seeded_store();
        let opts = DumpOptions {
            include_vectors: true,
            include_metadata: true,
            filter: Some(vec![(
                "category".to_string(),
                FilterSpec::Equals(crate::facets::FilterValue::String("tech".to_string())),
            )]),
            collection_id: None,
            gzip: false,
        };
        let mut buf = Vec::new();
        dump_json(&store, std::io::Cursor::new(&mut buf), &opts, &CancellationToken::none()).unwrap();

        let load_opts = LoadOptions { skip_existing: true, ..Default::default() };
        let stats = load(
            &store,
            std::io::Cursor::new(buf),
            DumpFormat::Json,
            &load_opts,
            &CancellationToken::none(),
        )
        .unwrap();
        assert_eq!(stats.total_embeddings, 1);
        assert_eq!(stats.skipped_count, 1);
    }

    #[test]
    fn dry_run_load_writes_nothing() {
        let store = Store::new(":memory:", 3);
        store.init(&CancellationToken::none()).unwrap();
        let cancel = CancellationToken::none();

        let source = seeded_store();
        let mut buf = Vec::new();
        dump_jsonl(
            &source,
            std::io::Cursor::new(&mut buf),
            &DumpOptions { include_vectors: true, include_metadata: true, filter: None, collection_id: None, gzip: false },
            &cancel,
        )
        .unwrap();

        let opts = LoadOptions { dry_run: true, ..Default::default() };
        load(&store, std::io::Cursor::new(buf), DumpFormat::Jsonl, &opts, &cancel).unwrap();

        let rows = store.iterate(None, None, &cancel).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn gzip_round_trips() {
        let store = seeded_store();
        let opts = DumpOptions { include_vectors: true, include_metadata: true, filter: None, collection_id: None, gzip: true };
        let mut buf = Vec::new();
        dump_json(&store, std::io::Cursor::new(&mut buf), &opts, &CancellationToken::none()).unwrap();

        let mut decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(buf));
        let mut text = String::new();
        decoder.read_to_string(&mut text).unwrap();
        let envelope: DumpEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope.embeddings.len(), 2);
    }

    #[test]
    fn round_trip_preserves_content_and_vector() {
        let source = seeded_store();
        let dest = Store::new(":memory:", 3);
        dest.init(&CancellationToken::none()).unwrap();
        let cancel = CancellationToken::none();

        let mut buf = Vec::new();
        dump_jsonl(
            &source,
            std::io::Cursor::new(&mut buf),
            &DumpOptions { include_vectors: true, include_metadata: true, filter: None, collection_id: None, gzip: false },
            &cancel,
        )
        .unwrap();
        load(&dest, std::io::Cursor::new(buf), DumpFormat::Jsonl, &LoadOptions::default(), &cancel).unwrap();

        let got = dest.get_by_id("tech1", &cancel).unwrap();
        assert_eq!(got.content, "rust");
        assert!((got.vector[0] - 1.0).abs() < 1e-6);
    }
}
