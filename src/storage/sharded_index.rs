//! An ID → slot-index map sharded across several locks to cut contention on
//! read-heavy workloads, compared to one `FxHashMap` behind a single lock.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

const SHARD_COUNT: usize = 16;

/// Maps a 128-bit vector id to the slot index holding its index-file entry.
pub(crate) struct ShardedIndex {
    shards: Vec<RwLock<FxHashMap<u128, usize>>>,
}

impl ShardedIndex {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(FxHashMap::default())).collect(),
        }
    }

    fn shard_for(&self, id: u128) -> &RwLock<FxHashMap<u128, usize>> {
        let idx = (id as usize) % self.shards.len();
        &self.shards[idx]
    }

    pub fn get(&self, id: u128) -> Option<usize> {
        self.shard_for(id).read().get(&id).copied()
    }

    pub fn insert(&self, id: u128, slot: usize) -> Option<usize> {
        self.shard_for(id).write().insert(id, slot)
    }

    pub fn remove(&self, id: u128) -> Option<usize> {
        self.shard_for(id).write().remove(&id)
    }

    pub fn contains(&self, id: u128) -> bool {
        self.shard_for(id).read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every `(id, slot)` pair, in unspecified order.
    pub fn entries(&self) -> Vec<(u128, usize)> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            out.extend(shard.read().iter().map(|(&k, &v)| (k, v)));
        }
        out
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let idx = ShardedIndex::new();
        assert_eq!(idx.insert(1, 0), None);
        assert_eq!(idx.get(1), Some(0));
        assert!(idx.contains(1));
        assert_eq!(idx.remove(1), Some(0));
        assert_eq!(idx.get(1), None);
    }

    #[test]
    fn len_tracks_distinct_shards() {
        let idx = ShardedIndex::new();
        for i in 0..100u128 {
            idx.insert(i, i as usize);
        }
        assert_eq!(idx.len(), 100);
        assert_eq!(idx.entries().len(), 100);
    }
}
