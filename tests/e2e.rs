//! End-to-end scenarios exercised only through the public `Store` API,
//! corresponding to the concrete scenarios S1-S6 in the engine's
//! testable-properties section.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vectorlite::cancellation::CancellationToken;
use vectorlite::config::{HnswConfig, StoreConfig};
use vectorlite::dimension::DimensionPolicy;
use vectorlite::error::StoreError;
use vectorlite::executor::{MetricMode, RangeSearchOptions, SearchOptions};
use vectorlite::facets::{FilterSpec, FilterValue};
use vectorlite::importexport::{dump_json, load, DumpFormat, DumpOptions, LoadOptions};
use vectorlite::similarity::{cosine_similarity, SimilarityKind};
use vectorlite::store::{NewEmbedding, Store};

fn cancel() -> CancellationToken {
    CancellationToken::none()
}

/// S1: a 3-dimensional collection under the default `SmartAdapt` policy
/// accepts vectors of mismatched native length by padding/truncating, and a
/// cosine query still ranks the exactly-aligned vector first.
#[test]
fn s1_smart_adapt_ranks_exact_match_first() {
    let store = Store::new(":memory:", 3);
    store.init(&cancel()).unwrap();

    store
        .upsert(NewEmbedding::new("v3d", vec![1.0, 0.0, 0.0], "three dims"), &cancel())
        .unwrap();
    store
        .upsert(NewEmbedding::new("v2d", vec![0.7, 0.7], "two dims, padded"), &cancel())
        .unwrap();
    store
        .upsert(
            NewEmbedding::new("v4d", vec![0.5, 0.5, 0.5, 0.5], "four dims, truncated"),
            &cancel(),
        )
        .unwrap();

    let v2d = store.get_by_id("v2d", &cancel()).unwrap();
    assert_eq!(v2d.vector.len(), 3);
    let v4d = store.get_by_id("v4d", &cancel()).unwrap();
    assert_eq!(v4d.vector.len(), 3);

    let hits = store
        .search(
            &[1.0, 0.0, 0.0],
            None,
            &SearchOptions { top_k: 3, ..Default::default() },
            &cancel(),
        )
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].id, "v3d");
}

/// S2: Euclidean distance with HNSW disabled. Nine points at known
/// distances from the origin; three successive radii partition them into
/// 4, 7, and 9 points exactly.
#[test]
fn s2_range_search_euclidean_raw_distance_thresholds() {
    let mut config = StoreConfig {
        similarity_fn: SimilarityKind::EuclideanDist,
        auto_normalize: false,
        auto_dim_adapt: DimensionPolicy::WarnOnly,
        hnsw: HnswConfig { enabled: false, ..HnswConfig::default() },
        ..StoreConfig::new(":memory:")
    };
    config.vector_dim = 3;
    let store = Store::new_with_config(config);
    store.init(&cancel()).unwrap();

    let points: &[(&str, [f32; 3])] = &[
        ("origin", [0.0, 0.0, 0.0]), // distance 0
        ("p1", [1.0, 0.0, 0.0]),     // distance 1
        ("p2", [0.0, 1.0, 0.0]),     // distance 1
        ("p3", [0.0, 0.0, 1.0]),     // distance 1
        ("p4", [1.0, 1.0, 0.0]),     // distance sqrt(2)
        ("p5", [1.0, 0.0, 1.0]),     // distance sqrt(2)
        ("p6", [0.0, 1.0, 1.0]),     // distance sqrt(2)
        ("p7", [1.0, 1.0, 1.0]),     // distance sqrt(3)
        ("far", [3.0, 3.0, 3.0]),    // distance 3*sqrt(3)
    ];
    for (id, v) in points {
        store.upsert(NewEmbedding::new(*id, v.to_vec(), *id), &cancel()).unwrap();
    }

    let opts = RangeSearchOptions { metric_mode: MetricMode::RawDistance, filter: None };

    let r1 = store.range_search(&[0.0, 0.0, 0.0], 1.0, None, &opts, &cancel()).unwrap();
    assert_eq!(r1.len(), 4);

    let r2 = store.range_search(&[0.0, 0.0, 0.0], 1.5, None, &opts, &cancel()).unwrap();
    assert_eq!(r2.len(), 7);

    let r3 = store.range_search(&[0.0, 0.0, 0.0], 10.0, None, &opts, &cancel()).unwrap();
    assert_eq!(r3.len(), 9);
}

/// S3: under `WarnOnly`, any dimension mismatch fails fast on both the
/// write and the read path, with no reshaping attempted.
#[test]
fn s3_warn_only_rejects_mismatched_vectors() {
    let mut config = StoreConfig::new(":memory:");
    config.vector_dim = 3;
    config.auto_dim_adapt = DimensionPolicy::WarnOnly;
    let store = Store::new_with_config(config);
    store.init(&cancel()).unwrap();

    let err = store
        .upsert(NewEmbedding::new("bad", vec![1.0, 2.0], "too short"), &cancel())
        .unwrap_err();
    assert!(matches!(err, StoreError::DimensionMismatch { expected: 3, actual: 2, .. }));

    store
        .upsert(NewEmbedding::new("good", vec![1.0, 0.0, 0.0], "ok"), &cancel())
        .unwrap();

    let err = store
        .search(&[1.0, 2.0], None, &SearchOptions { top_k: 1, ..Default::default() }, &cancel())
        .unwrap_err();
    assert!(matches!(err, StoreError::DimensionMismatch { expected: 3, actual: 2, .. }));
}

/// S4: a category-filtered dump writes exactly one embedding; loading that
/// one-item dump back into the same store with `skip_existing` counts it
/// as a skip rather than a second write.
#[test]
fn s4_filtered_dump_then_skip_existing_load() {
    let store = Store::new(":memory:", 4);
    store.init(&cancel()).unwrap();

    for (id, category) in [("e-tech", "tech"), ("e-science", "science"), ("e-art", "art")] {
        let mut e = NewEmbedding::new(id, vec![1.0, 0.0, 0.0, 0.0], category);
        e.metadata = serde_json::json!({"category": category});
        store.upsert(e, &cancel()).unwrap();
    }

    let dump_opts = DumpOptions {
        include_vectors: true,
        include_metadata: true,
        filter: Some(vec![(
            "category".to_string(),
            FilterSpec::Equals(FilterValue::String("tech".to_string())),
        )]),
        collection_id: None,
        gzip: false,
    };
    let mut buf = Vec::new();
    let dump_stats = dump_json(&store, std::io::Cursor::new(&mut buf), &dump_opts, &cancel()).unwrap();
    assert_eq!(dump_stats.total_embeddings, 1);

    let load_opts = LoadOptions { skip_existing: true, ..Default::default() };
    let load_stats = load(&store, std::io::Cursor::new(buf), DumpFormat::Json, &load_opts, &cancel()).unwrap();
    assert_eq!(load_stats.total_embeddings, 1);
    assert_eq!(load_stats.skipped_count, 1);
}

/// S5: a backup is a faithful, independently-openable copy — searching it
/// returns the same top-1 result as the source store.
#[test]
fn s5_backup_preserves_search_results() {
    let src_file = tempfile::NamedTempFile::new().unwrap();
    let src_path = src_file.path().to_str().unwrap().to_string();
    std::fs::remove_file(&src_path).ok();

    let store = Store::new(&src_path, 3);
    store.init(&cancel()).unwrap();
    store.upsert(NewEmbedding::new("aligned", vec![1.0, 0.0, 0.0], "a"), &cancel()).unwrap();
    store.upsert(NewEmbedding::new("orthogonal", vec![0.0, 1.0, 0.0], "b"), &cancel()).unwrap();

    let backup_file = tempfile::NamedTempFile::new().unwrap();
    let backup_path = backup_file.path().to_str().unwrap().to_string();
    std::fs::remove_file(&backup_path).ok();
    store.backup(&backup_path).unwrap();

    let query = [1.0, 0.0, 0.0];
    let source_hits = store
        .search(&query, None, &SearchOptions { top_k: 1, ..Default::default() }, &cancel())
        .unwrap();

    let restored = Store::new(&backup_path, 3);
    restored.init(&cancel()).unwrap();
    let restored_hits = restored
        .search(&query, None, &SearchOptions { top_k: 1, ..Default::default() }, &cancel())
        .unwrap();

    assert_eq!(source_hits[0].id, restored_hits[0].id);

    store.close().unwrap();
    restored.close().unwrap();
    std::fs::remove_file(&src_path).ok();
    std::fs::remove_file(&backup_path).ok();
}

/// S6: HNSW search over 2,000 random 32-dimensional vectors should agree
/// with brute-force on at least 8 of the top 10.
#[test]
fn s6_hnsw_recall_against_brute_force() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut vectors: Vec<(String, Vec<f32>)> = Vec::with_capacity(2000);
    for i in 0..2000 {
        let v: Vec<f32> = (0..32).map(|_| rng.gen_range(-1.0..1.0)).collect();
        vectors.push((format!("v{i}"), v));
    }

    let store = Store::new(":memory:", 32);
    store.init(&cancel()).unwrap();
    for (id, v) in &vectors {
        store.upsert(NewEmbedding::new(id.clone(), v.clone(), id.clone()), &cancel()).unwrap();
    }

    let query: Vec<f32> = (0..32).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let hits = store
        .search(&query, None, &SearchOptions { top_k: 10, ..Default::default() }, &cancel())
        .unwrap();
    assert_eq!(hits.len(), 10);

    let mut brute: Vec<(String, f32)> = vectors
        .iter()
        .map(|(id, v)| (id.clone(), cosine_similarity(&query, v)))
        .collect();
    brute.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    let brute_top10: HashSet<&str> = brute.iter().take(10).map(|(id, _)| id.as_str()).collect();

    let overlap = hits.iter().filter(|h| brute_top10.contains(h.id.as_str())).count();
    assert!(overlap >= 8, "overlap was {overlap}");
}
