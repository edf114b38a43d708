//! A single HNSW graph layer: an adjacency list keyed by node index.

use rustc_hash::FxHashMap;

/// Adjacency list for one layer of the graph. Nodes absent from a given
/// layer simply have no entry.
pub(super) struct Layer {
    adjacency: FxHashMap<usize, Vec<usize>>,
}

impl Layer {
    pub(super) fn new() -> Self {
        Self { adjacency: FxHashMap::default() }
    }

    pub(super) fn ensure_node(&mut self, node: usize) {
        self.adjacency.entry(node).or_default();
    }

    pub(super) fn neighbors(&self, node: usize) -> Vec<usize> {
        self.adjacency.get(&node).cloned().unwrap_or_default()
    }

    pub(super) fn connect(&mut self, node: usize, neighbor: usize) {
        let list = self.adjacency.entry(node).or_default();
        if !list.contains(&neighbor) {
            list.push(neighbor);
        }
    }

    pub(super) fn set_neighbors(&mut self, node: usize, neighbors: Vec<usize>) {
        self.adjacency.insert(node, neighbors);
    }

    /// Every node's adjacency list, for persistence. Order is unspecified.
    pub(super) fn entries(&self) -> impl Iterator<Item = (&usize, &Vec<usize>)> {
        self.adjacency.iter()
    }

    pub(super) fn from_entries(entries: Vec<(usize, Vec<usize>)>) -> Self {
        Self { adjacency: entries.into_iter().collect() }
    }
}
