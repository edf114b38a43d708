//! Native HNSW index (spec §4.4.5): a layered navigable small-world graph
//! with per-layer adjacency lists, greedy upper-layer descent, and a
//! best-first search at layer 0.

mod layer;

use super::codec::{read_u128, read_u32, read_u64, read_u8, write_u128, write_u32, write_u64, write_u8};
use super::{snapshot_map, IndexEntry, SearchIndex};
use crate::distance::DistanceMetric;
use crate::error::Result;
use crate::point::{ScoredId, VectorId};
use crate::rng::Xorshift64;
use layer::Layer;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Ordf(f32);
impl Eq for Ordf {}
impl Ord for Ordf {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}
impl PartialOrd for Ordf {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Hierarchical navigable small world graph over vectors of a fixed
/// dimension and a single [`DistanceMetric`].
pub struct HnswIndex {
    metric: DistanceMetric,
    ids: RwLock<Vec<VectorId>>,
    vectors: RwLock<Vec<Vec<f32>>>,
    layers: RwLock<Vec<Layer>>,
    entry_point: RwLock<Option<NodeId>>,
    max_layer: AtomicUsize,
    count: AtomicUsize,
    rng_state: AtomicU64,
    max_connections: usize,
    max_connections_0: usize,
    ef_construction: usize,
    ef_search: usize,
    level_mult: f64,
}

impl HnswIndex {
    #[must_use]
    pub fn new(metric: DistanceMetric, m: usize, ef_construction: usize, ef_search: usize, seed: u64) -> Self {
        let m = m.max(2);
        Self {
            metric,
            ids: RwLock::new(Vec::new()),
            vectors: RwLock::new(Vec::new()),
            layers: RwLock::new(vec![Layer::new()]),
            entry_point: RwLock::new(None),
            max_layer: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            rng_state: AtomicU64::new(seed),
            max_connections: m,
            max_connections_0: m * 2,
            ef_construction,
            ef_search,
            level_mult: 1.0 / (m as f64).ln(),
        }
    }

    fn random_level(&self) -> usize {
        let mut rng = Xorshift64::new(self.rng_state.fetch_add(1, Ordering::Relaxed));
        rng.random_level(self.level_mult, 15)
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self.metric.scalar(a, b).unwrap_or(f32::INFINITY)
    }

    fn search_layer_single(&self, query: &[f32], entry: NodeId, layer: usize) -> NodeId {
        let vectors = self.vectors.read();
        let mut best = entry;
        let mut best_dist = self.distance(query, &vectors[entry]);
        loop {
            let neighbors = self.layers.read()[layer].neighbors(best);
            let mut improved = false;
            for neighbor in neighbors {
                let d = self.distance(query, &vectors[neighbor]);
                if d < best_dist {
                    best = neighbor;
                    best_dist = d;
                    improved = true;
                }
            }
            if !improved {
                break;
            }
        }
        best
    }

    fn search_layer(&self, query: &[f32], entry_points: &[NodeId], ef: usize, layer: usize) -> Vec<(NodeId, f32)> {
        let vectors = self.vectors.read();
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        let mut candidates: BinaryHeap<Reverse<(Ordf, NodeId)>> = BinaryHeap::new();
        let mut results: BinaryHeap<(Ordf, NodeId)> = BinaryHeap::new();

        for &ep in entry_points {
            let d = self.distance(query, &vectors[ep]);
            candidates.push(Reverse((Ordf(d), ep)));
            results.push((Ordf(d), ep));
            visited.insert(ep);
        }

        while let Some(Reverse((Ordf(c_dist), c_node))) = candidates.pop() {
            let furthest = results.peek().map_or(f32::MAX, |r| r.0 .0);
            if c_dist > furthest && results.len() >= ef {
                break;
            }
            let neighbors = self.layers.read()[layer].neighbors(c_node);
            for neighbor in neighbors {
                if visited.insert(neighbor) {
                    let d = self.distance(query, &vectors[neighbor]);
                    let furthest = results.peek().map_or(f32::MAX, |r| r.0 .0);
                    if d < furthest || results.len() < ef {
                        candidates.push(Reverse((Ordf(d), neighbor)));
                        results.push((Ordf(d), neighbor));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut out: Vec<(NodeId, f32)> = results.into_iter().map(|(d, n)| (n, d.0)).collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1));
        out
    }

    /// Greedily selects up to `m` neighbors from `candidates`, preferring
    /// ones that are not already well covered by an already-selected
    /// neighbor (a simplified VAMANA-style diversification pass).
    fn select_neighbors(&self, candidates: Vec<(NodeId, f32)>, m: usize) -> Vec<NodeId> {
        let vectors = self.vectors.read();
        let mut sorted = candidates;
        sorted.sort_by(|a, b| a.1.total_cmp(&b.1));
        let mut selected: Vec<NodeId> = Vec::with_capacity(m);

        for (candidate, candidate_dist) in sorted {
            if selected.len() >= m {
                break;
            }
            let mut dominated = false;
            for &already in &selected {
                let d = self.distance(&vectors[candidate], &vectors[already]);
                if d < candidate_dist {
                    dominated = true;
                    break;
                }
            }
            if !dominated {
                selected.push(candidate);
            }
        }
        selected
    }

    fn connect(&self, node: NodeId, neighbors: &[NodeId], layer: usize, cap: usize) {
        let mut layers = self.layers.write();
        for &neighbor in neighbors {
            layers[layer].connect(node, neighbor);
            layers[layer].connect(neighbor, node);
            if layers[layer].neighbors(neighbor).len() > cap {
                let trimmed = {
                    let vectors = self.vectors.read();
                    let mut scored: Vec<(NodeId, f32)> = layers[layer]
                        .neighbors(neighbor)
                        .into_iter()
                        .map(|n| (n, self.distance(&vectors[neighbor], &vectors[n])))
                        .collect();
                    scored.sort_by(|a, b| a.1.total_cmp(&b.1));
                    scored.truncate(cap);
                    scored.into_iter().map(|(n, _)| n).collect::<Vec<_>>()
                };
                layers[layer].set_neighbors(neighbor, trimmed);
            }
        }
    }

    fn insert(&self, values: Vec<f32>) -> NodeId {
        let node_id = {
            let mut vectors = self.vectors.write();
            vectors.push(values.clone());
            vectors.len() - 1
        };

        let level = self.random_level();
        {
            let mut layers = self.layers.write();
            while layers.len() <= level {
                layers.push(Layer::new());
            }
            for l in layers.iter_mut().take(level + 1) {
                l.ensure_node(node_id);
            }
        }

        let entry_point = *self.entry_point.read();
        let Some(ep) = entry_point else {
            *self.entry_point.write() = Some(node_id);
            self.max_layer.store(level, Ordering::Relaxed);
            self.count.fetch_add(1, Ordering::Relaxed);
            return node_id;
        };

        let max_layer = self.max_layer.load(Ordering::Relaxed);
        let mut current_ep = ep;
        for l in ((level + 1)..=max_layer).rev() {
            current_ep = self.search_layer_single(&values, current_ep, l);
        }

        for l in (0..=level.min(max_layer)).rev() {
            let candidates = self.search_layer(&values, &[current_ep], self.ef_construction, l);
            let cap = if l == 0 { self.max_connections_0 } else { self.max_connections };
            let neighbors = self.select_neighbors(candidates, cap);
            self.connect(node_id, &neighbors, l, cap);
            if let Some(&best) = neighbors.first() {
                current_ep = best;
            }
        }

        if level > max_layer {
            *self.entry_point.write() = Some(node_id);
            self.max_layer.store(level, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        node_id
    }

    fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(NodeId, f32)> {
        let Some(ep) = *self.entry_point.read() else {
            return Vec::new();
        };
        let max_layer = self.max_layer.load(Ordering::Relaxed);
        let mut current_ep = ep;
        for l in (1..=max_layer).rev() {
            current_ep = self.search_layer_single(query, current_ep, l);
        }
        let mut candidates = self.search_layer(query, &[current_ep], ef.max(k), 0);
        candidates.truncate(k);
        candidates
    }
}

impl SearchIndex for HnswIndex {
    fn build(&mut self, entries: &[IndexEntry]) -> Result<()> {
        *self.ids.write() = Vec::new();
        *self.vectors.write() = Vec::new();
        *self.layers.write() = vec![Layer::new()];
        *self.entry_point.write() = None;
        self.max_layer.store(0, Ordering::Relaxed);
        self.count.store(0, Ordering::Relaxed);

        for (id, values) in entries {
            self.insert(values.clone());
            self.ids.write().push(*id);
        }
        Ok(())
    }

    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let ids = self.ids.read();
        let results = self.search(query, k, self.ef_search);
        Ok(results
            .into_iter()
            .map(|(node, dist)| ScoredId::new(ids[node], dist))
            .collect())
    }

    fn range(&self, query: &[f32], radius: f32) -> Result<Vec<ScoredId>> {
        let ids = self.ids.read();
        let higher_is_closer = self.metric.higher_is_closer();
        let ef = self.ef_search.max(self.count.load(Ordering::Relaxed));
        let results = self.search(query, self.count.load(Ordering::Relaxed).max(1), ef);
        Ok(results
            .into_iter()
            .filter(|(_, d)| if higher_is_closer { *d >= radius } else { *d <= radius })
            .map(|(node, dist)| ScoredId::new(ids[node], dist))
            .collect())
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Build params, rng state, counters, entry point, the dense
    /// node-index-ordered id list (vector values resolved via snapshot on
    /// load), then each layer's adjacency list.
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        write_u32(writer, self.max_connections as u32)?;
        write_u32(writer, self.max_connections_0 as u32)?;
        write_u32(writer, self.ef_construction as u32)?;
        write_u32(writer, self.ef_search as u32)?;
        write_u64(writer, self.rng_state.load(Ordering::Relaxed))?;
        write_u32(writer, self.count.load(Ordering::Relaxed) as u32)?;
        write_u32(writer, self.max_layer.load(Ordering::Relaxed) as u32)?;

        match *self.entry_point.read() {
            Some(node) => {
                write_u8(writer, 1)?;
                write_u32(writer, node as u32)?;
            }
            None => write_u8(writer, 0)?,
        }

        let ids = self.ids.read();
        write_u32(writer, ids.len() as u32)?;
        for id in ids.iter() {
            write_u128(writer, id.0)?;
        }

        let layers = self.layers.read();
        write_u32(writer, layers.len() as u32)?;
        for layer in layers.iter() {
            let entries: Vec<_> = layer.entries().collect();
            write_u32(writer, entries.len() as u32)?;
            for (&node, neighbors) in entries {
                write_u32(writer, node as u32)?;
                write_u32(writer, neighbors.len() as u32)?;
                for &neighbor in neighbors {
                    write_u32(writer, neighbor as u32)?;
                }
            }
        }
        Ok(())
    }

    fn load(&mut self, reader: &mut dyn Read, snapshot: &[IndexEntry]) -> Result<()> {
        let map = snapshot_map(snapshot);

        self.max_connections = read_u32(reader)? as usize;
        self.max_connections_0 = read_u32(reader)? as usize;
        self.ef_construction = read_u32(reader)? as usize;
        self.ef_search = read_u32(reader)? as usize;
        self.level_mult = 1.0 / (self.max_connections as f64).ln();
        self.rng_state.store(read_u64(reader)?, Ordering::Relaxed);
        self.count.store(read_u32(reader)? as usize, Ordering::Relaxed);
        self.max_layer.store(read_u32(reader)? as usize, Ordering::Relaxed);

        let has_entry_point = read_u8(reader)? != 0;
        let entry_point = if has_entry_point { Some(read_u32(reader)? as usize) } else { None };

        let id_count = read_u32(reader)? as usize;
        let mut ids = Vec::with_capacity(id_count);
        let mut vectors = Vec::with_capacity(id_count);
        for _ in 0..id_count {
            let id = read_u128(reader)?;
            let values = super::resolve(&map, id)?;
            ids.push(VectorId::from_u128(id));
            vectors.push(values);
        }

        let layer_count = read_u32(reader)? as usize;
        let mut layers = Vec::with_capacity(layer_count);
        for _ in 0..layer_count {
            let node_count = read_u32(reader)? as usize;
            let mut entries = Vec::with_capacity(node_count);
            for _ in 0..node_count {
                let node = read_u32(reader)? as usize;
                let neighbor_count = read_u32(reader)? as usize;
                let mut neighbors = Vec::with_capacity(neighbor_count);
                for _ in 0..neighbor_count {
                    neighbors.push(read_u32(reader)? as usize);
                }
                entries.push((node, neighbors));
            }
            layers.push(Layer::from_entries(entries));
        }

        *self.ids.write() = ids;
        *self.vectors.write() = vectors;
        *self.layers.write() = layers;
        *self.entry_point.write() = entry_point;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize) -> Vec<IndexEntry> {
        (0..n)
            .map(|i| (VectorId::from_u128(i as u128), vec![i as f32, (i as f32) * 0.3]))
            .collect()
    }

    #[test]
    fn nearest_finds_self() {
        let mut idx = HnswIndex::new(DistanceMetric::Euclidean, 8, 100, 50, 42);
        idx.build(&entries(300)).unwrap();
        let result = idx.nearest(&[150.0, 45.0], 1).unwrap();
        assert_eq!(result[0].id, VectorId::from_u128(150));
    }

    #[test]
    fn recall_is_reasonable_against_linear() {
        let mut idx = HnswIndex::new(DistanceMetric::Euclidean, 12, 150, 80, 7);
        let data = entries(500);
        idx.build(&data).unwrap();

        let mut hits = 0;
        for i in (0..500).step_by(25) {
            let (_, q) = &data[i];
            let result = idx.nearest(q, 5).unwrap();
            if result.iter().any(|r| r.id == VectorId::from_u128(i as u128)) {
                hits += 1;
            }
        }
        assert!(hits >= 15, "expected most self-queries to recall themselves, got {hits}/20");
    }

    #[test]
    fn empty_graph_returns_empty() {
        let idx = HnswIndex::new(DistanceMetric::Euclidean, 8, 100, 50, 1);
        assert!(idx.nearest(&[0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn save_load_round_trip() {
        let mut idx = HnswIndex::new(DistanceMetric::Euclidean, 8, 100, 50, 42);
        let data = entries(300);
        idx.build(&data).unwrap();
        let mut bytes = Vec::new();
        idx.save(&mut bytes).unwrap();

        let mut reloaded = HnswIndex::new(DistanceMetric::Euclidean, 8, 100, 50, 0);
        reloaded.load(&mut bytes.as_slice(), &data).unwrap();
        assert_eq!(reloaded.len(), idx.len());
        let result = reloaded.nearest(&[150.0, 45.0], 1).unwrap();
        assert_eq!(result[0].id, VectorId::from_u128(150));
    }

    #[test]
    fn deterministic_given_same_seed() {
        let data = entries(100);
        let mut a = HnswIndex::new(DistanceMetric::Euclidean, 8, 100, 50, 99);
        let mut b = HnswIndex::new(DistanceMetric::Euclidean, 8, 100, 50, 99);
        a.build(&data).unwrap();
        b.build(&data).unwrap();
        let ra = a.nearest(&[42.0, 12.0], 5).unwrap();
        let rb = b.nearest(&[42.0, 12.0], 5).unwrap();
        assert_eq!(ra, rb);
    }
}
