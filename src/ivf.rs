//! # IVF index
//!
//! Inverted-file clustering: k-means centroids partition the
//! vector space, each cell holding a posting list of embedding ids. Search
//! probes the `nprobe` nearest cells and brute-forces within their union.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::similarity::SimilarityFn;

/// Tuning parameters for an IVF index.
#[derive(Clone, Copy, Debug)]
pub struct IvfParams {
    /// Number of k-means clusters. Derived as `sqrt(N)` if `0` at build time.
    pub n_clusters: usize,
    /// Cells probed per query. Derived as `max(1, n_clusters/16)` if `0`.
    pub n_probe: usize,
}

/// K-means-partitioned inverted file index over `f32` vectors.
pub struct IvfIndex {
    dim: usize,
    similarity: SimilarityFn,
    params: IvfParams,
    centroids: Vec<Vec<f32>>,
    postings: Vec<Vec<u32>>,
    vectors: Vec<Vec<f32>>,
    ids: Vec<String>,
    id_index: HashMap<String, u32>,
    assignments: Vec<usize>,
    needs_rebuild: bool,
}

const KMEANS_MAX_ITERS: usize = 25;
const KMEANS_CONVERGENCE: f32 = 1e-4;
const POSTING_SKEW_THRESHOLD: f64 = 8.0;

impl IvfIndex {
    /// An empty index, ready to accumulate vectors before [`Self::build`].
    pub fn new(dim: usize, similarity: SimilarityFn, params: IvfParams) -> Self {
        Self {
            dim,
            similarity,
            params,
            centroids: Vec::new(),
            postings: Vec::new(),
            vectors: Vec::new(),
            ids: Vec::new(),
            id_index: HashMap::new(),
            assignments: Vec::new(),
            needs_rebuild: false,
        }
    }

    /// Number of vectors held by the index, live or not (IVF has no
    /// tombstone concept; deletes compact the posting lists directly).
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        -(self.similarity)(a, b)
    }

    fn resolved_n_clusters(&self, n: usize) -> usize {
        if self.params.n_clusters > 0 {
            self.params.n_clusters
        } else {
            (n as f64).sqrt().ceil().max(1.0) as usize
        }
    }

    fn resolved_n_probe(&self, n_clusters: usize) -> usize {
        if self.params.n_probe > 0 {
            self.params.n_probe
        } else {
            (n_clusters / 16).max(1)
        }
    }

    /// Build centroids and posting lists from every `(id, vector)` pair
    /// accumulated so far, via Lloyd's algorithm.
    pub fn build(&mut self, items: Vec<(String, Vec<f32>)>) {
        self.ids.clear();
        self.vectors.clear();
        self.id_index.clear();

        for (id, vector) in items {
            self.id_index.insert(id.clone(), self.ids.len() as u32);
            self.ids.push(id);
            self.vectors.push(vector);
        }

        let n = self.vectors.len();
        if n == 0 {
            self.centroids.clear();
            self.postings.clear();
            self.assignments.clear();
            self.needs_rebuild = false;
            return;
        }

        let k = self.resolved_n_clusters(n).min(n);
        let mut rng = rand::thread_rng();
        let mut centroids: Vec<Vec<f32>> = self
            .vectors
            .choose_multiple(&mut rng, k)
            .cloned()
            .collect();

        let mut assignments = vec![0usize; n];
        for _ in 0..KMEANS_MAX_ITERS {
            for (i, v) in self.vectors.iter().enumerate() {
                let mut best = 0;
                let mut best_dist = f32::INFINITY;
                for (c, centroid) in centroids.iter().enumerate() {
                    let d = self.distance(v, centroid);
                    if d < best_dist {
                        best_dist = d;
                        best = c;
                    }
                }
                assignments[i] = best;
            }

            let mut sums = vec![vec![0f32; self.dim]; k];
            let mut counts = vec![0usize; k];
            for (i, v) in self.vectors.iter().enumerate() {
                let c = assignments[i];
                counts[c] += 1;
                for (s, x) in sums[c].iter_mut().zip(v.iter()) {
                    *s += x;
                }
            }

            let mut max_shift = 0f32;
            for c in 0..k {
                if counts[c] == 0 {
                    continue;
                }
                let mut new_centroid = sums[c].clone();
                for x in new_centroid.iter_mut() {
                    *x /= counts[c] as f32;
                }
                let shift = self.distance(&centroids[c], &new_centroid).abs();
                max_shift = max_shift.max(shift);
                centroids[c] = new_centroid;
            }

            if max_shift < KMEANS_CONVERGENCE {
                break;
            }
        }

        let mut postings = vec![Vec::new(); k];
        for (i, &c) in assignments.iter().enumerate() {
            postings[c].push(i as u32);
        }

        self.centroids = centroids;
        self.postings = postings;
        self.assignments = assignments;
        self.needs_rebuild = false;
    }

    /// Route `vector` to its nearest centroid and append it to that cell's
    /// posting list without rebalancing.
    pub fn insert(&mut self, id: &str, vector: Vec<f32>) {
        if self.centroids.is_empty() {
            self.id_index.insert(id.to_string(), self.ids.len() as u32);
            self.ids.push(id.to_string());
            self.vectors.push(vector);
            self.assignments.push(0);
            return;
        }

        let mut best = 0;
        let mut best_dist = f32::INFINITY;
        for (c, centroid) in self.centroids.iter().enumerate() {
            let d = self.distance(&vector, centroid);
            if d < best_dist {
                best_dist = d;
                best = c;
            }
        }

        let idx = self.ids.len() as u32;
        self.id_index.insert(id.to_string(), idx);
        self.ids.push(id.to_string());
        self.vectors.push(vector);
        self.assignments.push(best);
        self.postings[best].push(idx);

        self.update_rebuild_flag();
    }

    fn update_rebuild_flag(&mut self) {
        let max = self.postings.iter().map(|p| p.len()).max().unwrap_or(0);
        let min = self.postings.iter().map(|p| p.len()).filter(|&l| l > 0).min().unwrap_or(1);
        if min > 0 && max as f64 / min as f64 > POSTING_SKEW_THRESHOLD {
            self.needs_rebuild = true;
        }
    }

    /// Whether posting-list skew has crossed the rebuild threshold
    /// (`max/min > 8`) since the last [`Self::build`].
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// Remove `id` from its posting list, if present.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(idx) = self.id_index.remove(id) else {
            return false;
        };
        if let Some(c) = self.assignments.get(idx as usize).copied() {
            if let Some(posting) = self.postings.get_mut(c) {
                posting.retain(|&i| i != idx);
            }
        }
        true
    }

    /// Probe the `nprobe` nearest cells to `query` and brute-force score
    /// their union, returning the top `k` `(id, score)` pairs.
    pub fn search(&self, query: &[f32], k: usize, n_probe: Option<usize>) -> Vec<(String, f32)> {
        if self.centroids.is_empty() {
            return Vec::new();
        }
        let n_probe = n_probe
            .unwrap_or_else(|| self.resolved_n_probe(self.centroids.len()))
            .min(self.centroids.len());

        let mut ranked_centroids: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(c, centroid)| (c, self.distance(query, centroid)))
            .collect();
        ranked_centroids.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut scored: Vec<(String, f32)> = Vec::new();
        for &(c, _) in ranked_centroids.iter().take(n_probe) {
            for &idx in &self.postings[c] {
                let score = (self.similarity)(query, &self.vectors[idx as usize]);
                scored.push((self.ids[idx as usize].clone(), score));
            }
        }

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    /// Serialize `(centroids, posting_lists)` for persistence under
    /// `type="ivf"`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let snapshot = IvfSnapshot {
            dim: self.dim,
            n_clusters: self.params.n_clusters,
            n_probe: self.params.n_probe,
            centroids: self.centroids.clone(),
            postings: self.postings.clone(),
            vectors: self.vectors.clone(),
            ids: self.ids.clone(),
            assignments: self.assignments.clone(),
        };
        bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .expect("IVF snapshot serialization cannot fail")
    }

    /// Reconstruct an index from bytes produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8], similarity: SimilarityFn) -> crate::error::Result<Self> {
        let (snapshot, _): (IvfSnapshot, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| crate::error::StoreError::corrupted("ivf_load", e.to_string()))?;

        let id_index = snapshot
            .ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i as u32))
            .collect();

        let mut index = Self {
            dim: snapshot.dim,
            similarity,
            params: IvfParams {
                n_clusters: snapshot.n_clusters,
                n_probe: snapshot.n_probe,
            },
            centroids: snapshot.centroids,
            postings: snapshot.postings,
            vectors: snapshot.vectors,
            ids: snapshot.ids,
            id_index,
            assignments: snapshot.assignments,
            needs_rebuild: false,
        };
        index.update_rebuild_flag();
        Ok(index)
    }
}

#[derive(Serialize, Deserialize)]
struct IvfSnapshot {
    dim: usize,
    n_clusters: usize,
    n_probe: usize,
    centroids: Vec<Vec<f32>>,
    postings: Vec<Vec<u32>>,
    vectors: Vec<Vec<f32>>,
    ids: Vec<String>,
    assignments: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::euclidean_similarity;

    fn sample_items() -> Vec<(String, Vec<f32>)> {
        vec![
            ("a".into(), vec![0.0, 0.0]),
            ("b".into(), vec![0.1, 0.0]),
            ("c".into(), vec![10.0, 10.0]),
            ("d".into(), vec![10.1, 10.0]),
        ]
    }

    #[test]
    fn build_clusters_nearby_points_together() {
        let mut idx = IvfIndex::new(
            2,
            euclidean_similarity,
            IvfParams {
                n_clusters: 2,
                n_probe: 2,
            },
        );
        idx.build(sample_items());
        assert_eq!(idx.len(), 4);

        let results = idx.search(&[0.0, 0.0], 2, None);
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"a"));
        assert!(ids.contains(&"b"));
    }

    #[test]
    fn delete_removes_from_posting_list() {
        let mut idx = IvfIndex::new(
            2,
            euclidean_similarity,
            IvfParams {
                n_clusters: 2,
                n_probe: 2,
            },
        );
        idx.build(sample_items());
        idx.delete("a");

        let results = idx.search(&[0.0, 0.0], 4, None);
        assert!(results.iter().all(|(id, _)| id != "a"));
    }

    #[test]
    fn snapshot_round_trips() {
        let mut idx = IvfIndex::new(
            2,
            euclidean_similarity,
            IvfParams {
                n_clusters: 2,
                n_probe: 2,
            },
        );
        idx.build(sample_items());
        let bytes = idx.to_bytes();
        let restored = IvfIndex::from_bytes(&bytes, euclidean_similarity).unwrap();
        assert_eq!(restored.len(), 4);
    }

    #[test]
    fn incremental_insert_sets_rebuild_flag_on_skew() {
        let mut idx = IvfIndex::new(
            2,
            euclidean_similarity,
            IvfParams {
                n_clusters: 2,
                n_probe: 2,
            },
        );
        idx.build(sample_items());
        for i in 0..20 {
            idx.insert(&format!("extra{i}"), vec![0.05, 0.0]);
        }
        assert!(idx.needs_rebuild());
    }
}
