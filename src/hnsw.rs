//! # HNSW index
//!
//! An in-memory Hierarchical Navigable Small World graph with dense `u32`
//! node ids and `SmallVec`-backed fixed-capacity neighbor lists, built for
//! incremental insertion, tombstone deletion, and binary snapshot
//! persistence rather than a one-shot batch build.
//!
//! Nodes are addressed by a dense `u32` index into a flat `Vec`; the
//! caller-facing string id is resolved through [`HnswIndex::id_index`].
//! Neighbor lists are fixed-capacity `SmallVec<[u32; 32]>`s, one per
//! `(layer, node)` pair, to keep small-degree graphs allocation-free.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::similarity::SimilarityFn;

type NeighborList = SmallVec<[u32; 32]>;

/// Wraps `f32` so it can sit in a [`BinaryHeap`]; `NaN` never appears here
/// because every distance is computed from finite, already-validated vectors.
#[derive(Clone, Copy, Debug, PartialEq)]
struct OrderedF32(f32);

impl Eq for OrderedF32 {}
impl PartialOrd for OrderedF32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OrderedF32 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// Tuning parameters for graph construction and search.
#[derive(Clone, Copy, Debug)]
pub struct HnswParams {
    /// Max neighbors per node per layer above 0.
    pub m: usize,
    /// Max neighbors per node at layer 0 (`2*m`).
    pub m0: usize,
    /// Beam width during insertion.
    pub ef_construction: usize,
    /// Default beam width during search.
    pub ef_search: usize,
}

impl HnswParams {
    /// Build params from the configured `M`, deriving `m0 = 2*m`.
    pub fn new(m: usize, ef_construction: usize, ef_search: usize) -> Self {
        Self {
            m,
            m0: m * 2,
            ef_construction,
            ef_search,
        }
    }

    /// `ml = 1 / ln(M)`, the layer-sampling scale factor.
    fn ml(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }
}

struct Node {
    external_id: String,
    vector: Vec<f32>,
    layer: usize,
    tombstoned: bool,
}

/// An in-memory HNSW graph over `f32` vectors, keyed by caller-supplied
/// string ids.
pub struct HnswIndex {
    dim: usize,
    params: HnswParams,
    similarity: SimilarityFn,
    nodes: Vec<Node>,
    id_index: HashMap<String, u32>,
    /// `layers[l][node]` is `node`'s neighbor list at layer `l`. Every
    /// layer's outer `Vec` is kept the same length as `nodes`; nodes that
    /// don't reach that layer simply have an empty list.
    layers: Vec<Vec<NeighborList>>,
    entry_point: Option<u32>,
    tombstone_count: usize,
}

impl HnswIndex {
    /// Create an empty index for `dim`-dimensional vectors scored by
    /// `similarity`.
    pub fn new(dim: usize, similarity: SimilarityFn, params: HnswParams) -> Self {
        Self {
            dim,
            params,
            similarity,
            nodes: Vec::new(),
            id_index: HashMap::new(),
            layers: Vec::new(),
            entry_point: None,
            tombstone_count: 0,
        }
    }

    /// Number of live (non-tombstoned) nodes.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.tombstone_count
    }

    /// Whether the index holds no live nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        // Similarity is "higher is better"; the graph reasons in distances,
        // so smaller is closer.
        -(self.similarity)(a, b)
    }

    fn sample_layer(&self) -> usize {
        let mut rng = rand::thread_rng();
        let u: f64 = rng.gen_range(f64::EPSILON..1.0);
        (-u.ln() * self.params.ml()).floor() as usize
    }

    fn ensure_layer_capacity(&mut self, layer: usize) {
        while self.layers.len() <= layer {
            self.layers.push(vec![NeighborList::new(); self.nodes.len()]);
        }
    }

    fn neighbors(&self, layer: usize, node: u32) -> &NeighborList {
        &self.layers[layer][node as usize]
    }

    fn neighbors_mut(&mut self, layer: usize, node: u32) -> &mut NeighborList {
        &mut self.layers[layer][node as usize]
    }

    /// Greedy descent from `entry` to the single closest node at `layer`,
    /// using ef=1.
    fn greedy_closest(&self, query: &[f32], entry: u32, layer: usize) -> u32 {
        let mut current = entry;
        let mut current_dist = self.distance(query, &self.nodes[entry as usize].vector);
        loop {
            let mut improved = false;
            for &neighbor in self.neighbors(layer, current).iter() {
                let d = self.distance(query, &self.nodes[neighbor as usize].vector);
                if d < current_dist {
                    current_dist = d;
                    current = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// ef-bounded beam search at `layer`, starting from `entry`. Returns up
    /// to `ef` `(node, distance)` pairs sorted by distance ascending,
    /// including tombstoned nodes (traversal must pass through them to
    /// preserve graph connectivity after soft deletion).
    fn search_layer(&self, query: &[f32], entry: u32, layer: usize, ef: usize) -> Vec<(u32, f32)> {
        let mut visited: HashSet<u32> = HashSet::new();
        visited.insert(entry);

        let entry_dist = self.distance(query, &self.nodes[entry as usize].vector);
        // Min-heap of candidates to explore, ordered nearest-first.
        let mut candidates: BinaryHeap<std::cmp::Reverse<(OrderedF32, u32)>> = BinaryHeap::new();
        candidates.push(std::cmp::Reverse((OrderedF32(entry_dist), entry)));
        // Max-heap of the current best `ef` results, farthest-first, so we
        // can cheaply evict the worst when a closer candidate appears.
        let mut results: BinaryHeap<(OrderedF32, u32)> = BinaryHeap::new();
        results.push((OrderedF32(entry_dist), entry));

        while let Some(std::cmp::Reverse((OrderedF32(cand_dist), cand))) = candidates.pop() {
            if let Some((OrderedF32(worst), _)) = results.peek() {
                if results.len() >= ef && cand_dist > *worst {
                    break;
                }
            }

            for &neighbor in self.neighbors(layer, cand).iter() {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = self.distance(query, &self.nodes[neighbor as usize].vector);
                let should_add = results.len() < ef
                    || results.peek().map(|(w, _)| dist < w.0).unwrap_or(true);
                if should_add {
                    candidates.push(std::cmp::Reverse((OrderedF32(dist), neighbor)));
                    results.push((OrderedF32(dist), neighbor));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(u32, f32)> = results.into_iter().map(|(d, n)| (n, d.0)).collect();
        out.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        out
    }

    /// Diversity-preferring neighbor selection: keep a candidate only if its
    /// distance to the new point is less than its distance to every
    /// already-selected neighbor.
    fn select_neighbors(&self, candidates: &[(u32, f32)], m: usize) -> NeighborList {
        let mut selected: NeighborList = NeighborList::new();
        for &(cand, cand_dist) in candidates {
            if selected.len() >= m {
                break;
            }
            let cand_vec = &self.nodes[cand as usize].vector;
            let diverse = selected.iter().all(|&s| {
                let d = self.distance(cand_vec, &self.nodes[s as usize].vector);
                cand_dist < d
            });
            if diverse || selected.is_empty() {
                selected.push(cand);
            }
        }
        // Diversity pruning can leave us short of `m`; backfill with the
        // closest remaining candidates.
        if selected.len() < m {
            for &(cand, _) in candidates {
                if selected.len() >= m {
                    break;
                }
                if !selected.contains(&cand) {
                    selected.push(cand);
                }
            }
        }
        selected
    }

    fn connect(&mut self, layer: usize, a: u32, b: u32, cap: usize) {
        if !self.neighbors(layer, a).contains(&b) {
            self.neighbors_mut(layer, a).push(b);
        }
        if self.neighbors(layer, a).len() > cap {
            self.prune(layer, a, cap);
        }
    }

    fn prune(&mut self, layer: usize, node: u32, cap: usize) {
        let vector = self.nodes[node as usize].vector.clone();
        let mut scored: Vec<(u32, f32)> = self
            .neighbors(layer, node)
            .iter()
            .map(|&n| (n, self.distance(&vector, &self.nodes[n as usize].vector)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        let kept = self.select_neighbors(&scored, cap);
        *self.neighbors_mut(layer, node) = kept;
    }

    /// Insert `vector` under `external_id`, replacing (tombstoning) any
    /// existing node with the same id. Returns the new node's dense index.
    pub fn insert(&mut self, external_id: &str, vector: Vec<f32>) -> u32 {
        debug_assert_eq!(vector.len(), self.dim);

        if let Some(&old) = self.id_index.get(external_id) {
            self.tombstone_node(old);
        }

        let layer = self.sample_layer();
        let node_id = self.nodes.len() as u32;
        self.nodes.push(Node {
            external_id: external_id.to_string(),
            vector: vector.clone(),
            layer,
            tombstoned: false,
        });
        self.id_index.insert(external_id.to_string(), node_id);
        self.ensure_layer_capacity(layer);
        for l in self.layers.iter_mut() {
            if l.len() < self.nodes.len() {
                l.push(NeighborList::new());
            }
        }

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(node_id);
            return node_id;
        };

        let top_layer = self.nodes[entry as usize].layer.max(
            self.layers.len().saturating_sub(1),
        );

        let mut current = entry;
        for l in ((layer + 1)..=top_layer).rev() {
            if l < self.layers.len() {
                current = self.greedy_closest(&vector, current, l);
            }
        }

        for l in (0..=layer.min(top_layer)).rev() {
            let cap = if l == 0 { self.params.m0 } else { self.params.m };
            let candidates = self.search_layer(&vector, current, l, self.params.ef_construction);
            let selected = self.select_neighbors(&candidates, cap);
            *self.neighbors_mut(l, node_id) = selected.clone();
            for &neighbor in selected.iter() {
                self.connect(l, neighbor, node_id, cap);
            }
            if let Some(&(closest, _)) = candidates.first() {
                current = closest;
            }
        }

        if layer > top_layer {
            self.entry_point = Some(node_id);
        }

        node_id
    }

    fn tombstone_node(&mut self, node: u32) {
        let n = &mut self.nodes[node as usize];
        if !n.tombstoned {
            n.tombstoned = true;
            self.tombstone_count += 1;
        }
    }

    /// Soft-delete the node for `external_id`, if present.
    pub fn delete(&mut self, external_id: &str) -> bool {
        if let Some(&node) = self.id_index.get(external_id) {
            self.tombstone_node(node);
            self.id_index.remove(external_id);
            true
        } else {
            false
        }
    }

    /// Whether the tombstone ratio exceeds the rebuild threshold (`> 0.2`).
    pub fn needs_rebuild(&self) -> bool {
        if self.nodes.is_empty() {
            return false;
        }
        self.tombstone_count as f64 / self.nodes.len() as f64 > 0.2
    }

    /// Rebuild the graph from scratch using only live vectors, reclaiming
    /// tombstoned space. Equivalent to discarding and re-inserting every
    /// live vector in id order.
    pub fn rebuild(&mut self) {
        let live: Vec<(String, Vec<f32>)> = self
            .nodes
            .iter()
            .filter(|n| !n.tombstoned)
            .map(|n| (n.external_id.clone(), n.vector.clone()))
            .collect();

        self.nodes.clear();
        self.id_index.clear();
        self.layers.clear();
        self.entry_point = None;
        self.tombstone_count = 0;

        for (id, vector) in live {
            self.insert(&id, vector);
        }
    }

    /// Return the `k` nearest live neighbors of `query`, using `ef` as the
    /// base-layer beam width (at least `max(ef_search, k)`).
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Vec<(String, f32)> {
        let Some(entry) = self.entry_point else {
            return Vec::new();
        };
        if self.is_empty() {
            return Vec::new();
        }

        let ef = ef.unwrap_or(self.params.ef_search).max(k);
        let top_layer = self.layers.len().saturating_sub(1);

        let mut current = entry;
        for l in (1..=top_layer).rev() {
            current = self.greedy_closest(query, current, l);
        }

        let candidates = self.search_layer(query, current, 0, ef);
        candidates
            .into_iter()
            .filter(|(n, _)| !self.nodes[*n as usize].tombstoned)
            .take(k)
            .map(|(n, d)| (self.nodes[n as usize].external_id.clone(), -d))
            .collect()
    }

    /// Serialize `(entry_point, per_layer_adjacency, vector_blob_index)` for
    /// persistence in `index_snapshots`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let snapshot = HnswSnapshot {
            dim: self.dim,
            params: (
                self.params.m,
                self.params.m0,
                self.params.ef_construction,
                self.params.ef_search,
            ),
            entry_point: self.entry_point,
            nodes: self
                .nodes
                .iter()
                .map(|n| SerializedNode {
                    external_id: n.external_id.clone(),
                    vector: n.vector.clone(),
                    layer: n.layer,
                    tombstoned: n.tombstoned,
                })
                .collect(),
            layers: self
                .layers
                .iter()
                .map(|l| l.iter().map(|n| n.to_vec()).collect())
                .collect(),
        };
        bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .expect("HNSW snapshot serialization cannot fail")
    }

    /// Reconstruct an index from bytes produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8], similarity: SimilarityFn) -> crate::error::Result<Self> {
        let (snapshot, _): (HnswSnapshot, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| crate::error::StoreError::corrupted("hnsw_load", e.to_string()))?;

        let (m, m0, ef_construction, ef_search) = snapshot.params;
        let mut tombstone_count = 0;
        let nodes = snapshot
            .nodes
            .into_iter()
            .map(|n| {
                if n.tombstoned {
                    tombstone_count += 1;
                }
                Node {
                    external_id: n.external_id,
                    vector: n.vector,
                    layer: n.layer,
                    tombstoned: n.tombstoned,
                }
            })
            .collect::<Vec<_>>();

        let id_index = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.tombstoned)
            .map(|(i, n)| (n.external_id.clone(), i as u32))
            .collect();

        let layers = snapshot
            .layers
            .into_iter()
            .map(|l| l.into_iter().map(NeighborList::from_vec).collect())
            .collect();

        Ok(Self {
            dim: snapshot.dim,
            params: HnswParams {
                m,
                m0,
                ef_construction,
                ef_search,
            },
            similarity,
            nodes,
            id_index,
            layers,
            entry_point: snapshot.entry_point,
            tombstone_count,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct SerializedNode {
    external_id: String,
    vector: Vec<f32>,
    layer: usize,
    tombstoned: bool,
}

#[derive(Serialize, Deserialize)]
struct HnswSnapshot {
    dim: usize,
    params: (usize, usize, usize, usize),
    entry_point: Option<u32>,
    nodes: Vec<SerializedNode>,
    layers: Vec<Vec<Vec<u32>>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;

    fn index(dim: usize) -> HnswIndex {
        HnswIndex::new(dim, cosine_similarity, HnswParams::new(8, 64, 32))
    }

    #[test]
    fn insert_and_search_returns_self_first() {
        let mut idx = index(3);
        idx.insert("a", vec![1.0, 0.0, 0.0]);
        idx.insert("b", vec![0.0, 1.0, 0.0]);
        idx.insert("c", vec![0.0, 0.0, 1.0]);

        let results = idx.search(&[1.0, 0.0, 0.0], 1, None);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn delete_removes_from_results() {
        let mut idx = index(3);
        idx.insert("a", vec![1.0, 0.0, 0.0]);
        idx.insert("b", vec![0.9, 0.1, 0.0]);
        idx.delete("a");

        let results = idx.search(&[1.0, 0.0, 0.0], 2, None);
        assert!(results.iter().all(|(id, _)| id != "a"));
    }

    #[test]
    fn tombstone_ratio_triggers_rebuild_flag() {
        let mut idx = index(2);
        for i in 0..10 {
            idx.insert(&format!("id{i}"), vec![i as f32, 0.0]);
        }
        for i in 0..3 {
            idx.delete(&format!("id{i}"));
        }
        assert!(idx.needs_rebuild());
        idx.rebuild();
        assert!(!idx.needs_rebuild());
        assert_eq!(idx.len(), 7);
    }

    #[test]
    fn reinsert_same_id_replaces_vector() {
        let mut idx = index(2);
        idx.insert("a", vec![1.0, 0.0]);
        idx.insert("a", vec![0.0, 1.0]);
        assert_eq!(idx.len(), 1);
        let results = idx.search(&[0.0, 1.0], 1, None);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn snapshot_round_trips() {
        let mut idx = index(3);
        idx.insert("a", vec![1.0, 0.0, 0.0]);
        idx.insert("b", vec![0.0, 1.0, 0.0]);
        let bytes = idx.to_bytes();
        let restored = HnswIndex::from_bytes(&bytes, cosine_similarity).unwrap();
        let results = restored.search(&[1.0, 0.0, 0.0], 1, None);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn recall_against_brute_force_is_high() {
        use rand::SeedableRng;
        use rand::rngs::StdRng;

        let mut rng = StdRng::seed_from_u64(42);
        let mut idx = HnswIndex::new(32, cosine_similarity, HnswParams::new(16, 200, 64));
        let mut vectors = Vec::new();
        for i in 0..500 {
            let v: Vec<f32> = (0..32).map(|_| rng.gen_range(-1.0..1.0)).collect();
            idx.insert(&format!("id{i}"), v.clone());
            vectors.push((format!("id{i}"), v));
        }

        let query: Vec<f32> = (0..32).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let ann = idx.search(&query, 10, None);

        let mut brute: Vec<(String, f32)> = vectors
            .iter()
            .map(|(id, v)| (id.clone(), cosine_similarity(&query, v)))
            .collect();
        brute.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let brute_top10: HashSet<&str> = brute.iter().take(10).map(|(id, _)| id.as_str()).collect();

        let overlap = ann.iter().filter(|(id, _)| brute_top10.contains(id.as_str())).count();
        assert!(overlap >= 7, "overlap was {overlap}");
    }
}
