//! # Query executor
//!
//! Candidate generation (ANN, FTS, brute-force), scoring, merging, ranking,
//! and faceted aggregation. This module is storage-agnostic: it operates
//! over an in-memory slice of [`EmbeddingRecord`] plus optional references to
//! the live [`HnswIndex`]/[`IvfIndex`]; [`crate::store::Store`] is
//! responsible for loading that slice (or the FTS candidate scores for
//! [`Executor::hybrid_search`]) from the relational file under its read
//! lock and handing it here.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use serde_json::Value;

use crate::cancellation::CancellationToken;
use crate::error::{Result, StoreError};
use crate::facets::CompiledFilter;
use crate::hnsw::HnswIndex;
use crate::ivf::IvfIndex;
use crate::similarity::SimilarityFn;

/// Number of scoring-loop iterations between cancellation checks, matching
/// the "length ≥ 1024" suspension-point rule for scoring loops.
const CANCEL_CHECK_STRIDE: usize = 1024;

/// A read-only, in-memory view of one embedding row, as loaded by the store
/// for a candidate set.
#[derive(Clone, Debug)]
pub struct EmbeddingRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub content: String,
    pub metadata: Value,
}

/// One ranked result.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub content: String,
    pub metadata: Value,
}

/// How [`Executor::range_search`] computes the distance compared against
/// the radius (open question resolved in `DESIGN.md`: callers must pick
/// one explicitly, there is no silent default).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricMode {
    /// `distance := 1 - score`. Meaningful for cosine/dot scores in `[-1, 1]`.
    OneMinusScore,
    /// `distance :=` the kernel's raw L2/L1 magnitude. Meaningful for
    /// Euclidean/Manhattan.
    RawDistance,
}

/// Options shared by [`Executor::search`] and [`Executor::search_with_facets`].
#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    pub top_k: usize,
    pub filter: Option<Vec<(String, crate::facets::FilterSpec)>>,
    pub similarity_override: Option<SimilarityFn>,
    /// Multiplier applied to `top_k` when asking the ANN index for
    /// candidates, to absorb filter rejection and scoring-order noise.
    pub overfetch: usize,
}

/// Options for [`Executor::range_search`].
#[derive(Clone, Debug)]
pub struct RangeSearchOptions {
    pub metric_mode: MetricMode,
    pub filter: Option<Vec<(String, crate::facets::FilterSpec)>>,
}

impl Default for RangeSearchOptions {
    fn default() -> Self {
        Self {
            metric_mode: MetricMode::OneMinusScore,
            filter: None,
        }
    }
}

/// A facet histogram entry: one distinct observed value and its count.
#[derive(Clone, Debug, PartialEq)]
pub struct FacetValueCount {
    pub value: Value,
    pub count: usize,
}

/// Options controlling [`Executor::search_with_facets`]'s histogram pass.
#[derive(Clone, Debug)]
pub struct FacetOptions {
    pub fields: Vec<String>,
    pub max_facet_values: usize,
}

impl Default for FacetOptions {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            max_facet_values: 10,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
struct HeapEntry {
    score: f32,
    id_rank: usize,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    // Min-heap keyed by score ascending (so the smallest score is evicted
    // first), ties broken by insertion order so ties resolve to id ascending
    // when candidates are pre-sorted by id.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id_rank.cmp(&self.id_rank))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Borrows everything needed to answer one collection's worth of queries:
/// the loaded candidate rows, the live ANN indexes (if enabled), and the
/// configured similarity kernel.
pub struct Executor<'a> {
    records: &'a [EmbeddingRecord],
    by_id: HashMap<&'a str, &'a EmbeddingRecord>,
    hnsw: Option<&'a HnswIndex>,
    ivf: Option<&'a IvfIndex>,
    similarity: SimilarityFn,
    hnsw_min_collection_size: usize,
}

impl<'a> Executor<'a> {
    pub fn new(
        records: &'a [EmbeddingRecord],
        hnsw: Option<&'a HnswIndex>,
        ivf: Option<&'a IvfIndex>,
        similarity: SimilarityFn,
        hnsw_min_collection_size: usize,
    ) -> Self {
        let by_id = records.iter().map(|r| (r.id.as_str(), r)).collect();
        Self {
            records,
            by_id,
            hnsw,
            ivf,
            similarity,
            hnsw_min_collection_size,
        }
    }

    fn candidate_ids(&self, query: &[f32], fetch: usize) -> Vec<String> {
        if let Some(hnsw) = self.hnsw {
            if self.records.len() >= self.hnsw_min_collection_size {
                return hnsw
                    .search(query, fetch, None)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
            }
        }
        if let Some(ivf) = self.ivf {
            if !ivf.is_empty() {
                return ivf
                    .search(query, fetch, None)
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
            }
        }
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    /// `Search(query, opts)`: ANN/IVF/brute-force candidate
    /// generation, metadata filter, scoring, then a bounded top-K heap.
    pub fn search(
        &self,
        query: &[f32],
        opts: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        if opts.top_k == 0 {
            return Err(StoreError::invalid("search", "top_k must be > 0"));
        }
        let similarity = opts.similarity_override.unwrap_or(self.similarity);
        let overfetch = opts.overfetch.max(1);
        let fetch = (opts.top_k * overfetch).max(opts.top_k);

        cancel.check("search")?;
        let candidate_ids = self.candidate_ids(query, fetch);
        let filter = match &opts.filter {
            Some(f) => Some(CompiledFilter::compile(f.clone())?),
            None => None,
        };

        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(opts.top_k + 1);
        let mut scored: Vec<(f32, &EmbeddingRecord)> = Vec::new();
        for (i, id) in candidate_ids.iter().enumerate() {
            if i % CANCEL_CHECK_STRIDE == 0 {
                cancel.check("search")?;
            }
            let Some(record) = self.by_id.get(id.as_str()) else {
                continue;
            };
            if let Some(filter) = &filter {
                if !filter.evaluate(&record.metadata) {
                    continue;
                }
            }
            let score = similarity(query, &record.vector);
            scored.push((score, record));
        }

        // Sort candidates by id first so ties are broken by id ascending
        // once pushed through the score-descending heap.
        scored.sort_by(|a, b| a.1.id.cmp(&b.1.id));
        for (rank, (score, record)) in scored.iter().enumerate() {
            heap.push(HeapEntry { score: *score, id_rank: rank });
            if heap.len() > opts.top_k {
                heap.pop();
            }
            let _ = record;
        }

        let mut ranked: Vec<(f32, &EmbeddingRecord)> = heap
            .into_iter()
            .map(|e| scored[e.id_rank])
            .collect();
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });

        Ok(ranked
            .into_iter()
            .map(|(score, record)| to_hit(record, score))
            .collect())
    }

    /// `RangeSearch(query, radius, opts)`: every candidate
    /// whose distance is within `radius`, sorted by score descending.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        opts: &RangeSearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        if radius <= 0.0 {
            return Err(StoreError::invalid("range_search", "radius must be > 0"));
        }
        cancel.check("range_search")?;

        let filter = match &opts.filter {
            Some(f) => Some(CompiledFilter::compile(f.clone())?),
            None => None,
        };

        let mut hits = Vec::new();
        for (i, record) in self.records.iter().enumerate() {
            if i % CANCEL_CHECK_STRIDE == 0 {
                cancel.check("range_search")?;
            }
            if let Some(filter) = &filter {
                if !filter.evaluate(&record.metadata) {
                    continue;
                }
            }
            let score = (self.similarity)(query, &record.vector);
            let distance = match opts.metric_mode {
                MetricMode::OneMinusScore => 1.0 - score,
                MetricMode::RawDistance => raw_distance(self.similarity, query, &record.vector),
            };
            if distance <= radius {
                hits.push((score, record));
            }
        }

        hits.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        Ok(hits.into_iter().map(|(score, r)| to_hit(r, score)).collect())
    }

    /// `SearchWithFacets(query, opts)`: [`Executor::search`]
    /// plus, per requested facet field, a histogram of the top
    /// `max_facet_values` distinct values over the unfiltered base set.
    /// Histogram failures never fail the primary search.
    pub fn search_with_facets(
        &self,
        query: &[f32],
        opts: &SearchOptions,
        facet_opts: &FacetOptions,
        cancel: &CancellationToken,
    ) -> Result<(Vec<SearchHit>, HashMap<String, Vec<FacetValueCount>>)> {
        let hits = self.search(query, opts, cancel)?;
        let facets = self.facet_histograms(facet_opts);
        Ok((hits, facets))
    }

    fn facet_histograms(&self, opts: &FacetOptions) -> HashMap<String, Vec<FacetValueCount>> {
        let mut out = HashMap::new();
        for field in &opts.fields {
            let mut counts: HashMap<String, (Value, usize)> = HashMap::new();
            for record in self.records {
                if let Some(value) = record.metadata.get(field) {
                    let key = value.to_string();
                    counts.entry(key).or_insert_with(|| (value.clone(), 0)).1 += 1;
                }
            }
            let mut histogram: Vec<FacetValueCount> = counts
                .into_values()
                .map(|(value, count)| FacetValueCount { value, count })
                .collect();
            histogram.sort_by(|a, b| b.count.cmp(&a.count));
            histogram.truncate(opts.max_facet_values);
            out.insert(field.clone(), histogram);
        }
        out
    }

    /// `HybridSearch(query, text, alpha, opts)`: combine
    /// vector score and FTS score as `alpha*v + (1-alpha)*fts_norm`, where
    /// `fts_scores` is the caller-supplied, already higher-is-better raw FTS
    /// score per candidate id (the store negates SQLite's `bm25()`, which is
    /// lower-is-better, before calling in). The candidate set is the union
    /// of the vector top-N and the ids present in `fts_scores`.
    pub fn hybrid_search(
        &self,
        query: &[f32],
        fts_scores: &HashMap<String, f32>,
        alpha: f32,
        opts: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(StoreError::invalid("hybrid_search", "alpha must be in [0, 1]"));
        }
        cancel.check("hybrid_search")?;

        let fetch = (opts.top_k.max(1) * opts.overfetch.max(1)).max(opts.top_k.max(1));
        let vector_ids: Vec<String> = self.candidate_ids(query, fetch);

        let mut union_ids: Vec<String> = vector_ids.clone();
        for id in fts_scores.keys() {
            if !union_ids.contains(id) {
                union_ids.push(id.clone());
            }
        }

        let fts_min = fts_scores.values().cloned().fold(f32::INFINITY, f32::min);
        let fts_max = fts_scores.values().cloned().fold(f32::NEG_INFINITY, f32::max);
        let fts_range = (fts_max - fts_min).max(f32::EPSILON);

        let mut scored: Vec<(f32, &EmbeddingRecord)> = Vec::new();
        for (i, id) in union_ids.iter().enumerate() {
            if i % CANCEL_CHECK_STRIDE == 0 {
                cancel.check("hybrid_search")?;
            }
            let Some(record) = self.by_id.get(id.as_str()) else {
                continue;
            };
            let vector_score = (self.similarity)(query, &record.vector);
            let fts_norm = fts_scores
                .get(id.as_str())
                .map(|raw| (raw - fts_min) / fts_range)
                .unwrap_or(0.0);
            let combined = alpha * vector_score + (1.0 - alpha) * fts_norm;
            scored.push((combined, record));
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.id.cmp(&b.1.id))
        });
        if opts.top_k > 0 {
            scored.truncate(opts.top_k);
        }
        Ok(scored.into_iter().map(|(score, r)| to_hit(r, score)).collect())
    }

    /// `BatchSearch(queries, opts)`: sequential fan-out of [`Executor::search`]
    /// within the caller's single critical section.
    pub fn batch_search(
        &self,
        queries: &[Vec<f32>],
        opts: &SearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<SearchHit>>> {
        queries
            .iter()
            .map(|q| self.search(q, opts, cancel))
            .collect()
    }

    /// `BatchRangeSearch(queries, radius, opts)`: sequential fan-out of
    /// [`Executor::range_search`].
    pub fn batch_range_search(
        &self,
        queries: &[Vec<f32>],
        radius: f32,
        opts: &RangeSearchOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<SearchHit>>> {
        queries
            .iter()
            .map(|q| self.range_search(q, radius, opts, cancel))
            .collect()
    }
}

fn raw_distance(similarity: SimilarityFn, a: &[f32], b: &[f32]) -> f32 {
    if similarity as usize == crate::similarity::euclidean_similarity as usize {
        crate::similarity::euclidean_l2(a, b)
    } else if similarity as usize == crate::similarity::manhattan_similarity as usize {
        crate::similarity::manhattan_l1(a, b)
    } else {
        1.0 - similarity(a, b)
    }
}

fn to_hit(record: &EmbeddingRecord, score: f32) -> SearchHit {
    SearchHit {
        id: record.id.clone(),
        score,
        content: record.content.clone(),
        metadata: record.metadata.clone(),
    }
}
