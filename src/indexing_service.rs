//! Background indexing service (spec §4.5, §9): coalesces store mutations
//! and rebuilds the enabled search indexes without blocking mutators.
//!
//! Grounded on the corpus's general preference for `crossbeam-channel` +
//! `parking_lot` over an async runtime for a non-networked background
//! worker, and on the §9 redesign note's explicit state machine (replacing
//! a shared mutable dirty-flag-plus-timestamp pattern).

use crate::config::{DefaultAlgorithm, HnswConfig, PqConfig};
use crate::distance::DistanceMetric;
use crate::error::Result;
use crate::index::balltree::BallTreeIndex;
use crate::index::hnsw::HnswIndex;
use crate::index::kdtree::KdTreeIndex;
use crate::index::linear::LinearIndex;
use crate::index::lsh::LshIndex;
use crate::index::quantization::{BinaryQuantizationIndex, ProductQuantizationIndex};
use crate::index::{IndexEntry, SearchIndex};
use crate::point::VectorId;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rayon::prelude::*;
use roaring::RoaringBitmap;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// A concrete index family the service knows how to build. Distinct from
/// [`DefaultAlgorithm`], which additionally has an `Auto` dispatch mode that
/// doesn't name a buildable index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Linear,
    KdTree,
    BallTree,
    Lsh,
    Hnsw,
    BinaryQuantization,
    ProductQuantization,
}

impl IndexKind {
    pub(crate) fn from_algorithm(algorithm: DefaultAlgorithm) -> Option<Self> {
        match algorithm {
            DefaultAlgorithm::Auto => None,
            DefaultAlgorithm::Linear => Some(Self::Linear),
            DefaultAlgorithm::KdTree => Some(Self::KdTree),
            DefaultAlgorithm::BallTree => Some(Self::BallTree),
            DefaultAlgorithm::Lsh => Some(Self::Lsh),
            DefaultAlgorithm::Hnsw => Some(Self::Hnsw),
            DefaultAlgorithm::BinaryQuantization => Some(Self::BinaryQuantization),
            DefaultAlgorithm::ProductQuantization => Some(Self::ProductQuantization),
        }
    }
}

/// An immutable, atomically-publishable snapshot of every enabled index plus
/// the tag inverted index, rebuilt together on each cycle.
pub struct PublishedIndexes {
    pub indexes: FxHashMap<IndexKind, Box<dyn SearchIndex>>,
    pub tags: FxHashMap<u16, RoaringBitmap>,
    pub built_at: u64,
}

impl PublishedIndexes {
    fn empty() -> Self {
        Self { indexes: FxHashMap::default(), tags: FxHashMap::default(), built_at: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Clean,
    Dirty(u64),
    Quiescent(u64),
    Building,
}

/// Parameters the rebuild cycle needs beyond the raw vector snapshot.
pub struct IndexingServiceConfig {
    pub metric: DistanceMetric,
    pub enabled: Vec<IndexKind>,
    pub quiet_period: Duration,
    pub poll_interval: Duration,
    pub hnsw: HnswConfig,
    pub pq: PqConfig,
    pub kd_parallel_threshold: usize,
}

type SnapshotFn = dyn Fn() -> Result<Vec<IndexEntry>> + Send + Sync;
type TagFn = dyn Fn() -> Vec<(VectorId, BTreeSet<u16>)> + Send + Sync;

/// Coordinates background index rebuilds over a pluggable vector snapshot
/// source, so it has no direct dependency on `VectorStore`.
pub struct IndexingService {
    state: Mutex<State>,
    mutated_during_build: AtomicBool,
    published: ArcSwap<PublishedIndexes>,
    cancel: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    config: IndexingServiceConfig,
    snapshot_fn: Arc<SnapshotFn>,
    tag_fn: Arc<TagFn>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IndexingService {
    #[must_use]
    pub fn new(
        config: IndexingServiceConfig,
        snapshot_fn: impl Fn() -> Result<Vec<IndexEntry>> + Send + Sync + 'static,
        tag_fn: impl Fn() -> Vec<(VectorId, BTreeSet<u16>)> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Clean),
            mutated_during_build: AtomicBool::new(false),
            published: ArcSwap::from_pointee(PublishedIndexes::empty()),
            cancel: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
            config,
            snapshot_fn: Arc::new(snapshot_fn),
            tag_fn: Arc::new(tag_fn),
            handle: Mutex::new(None),
        })
    }

    /// Returns the currently published index snapshot.
    #[must_use]
    pub fn published(&self) -> Arc<PublishedIndexes> {
        self.published.load_full()
    }

    /// Marks the store dirty as of now. Called by the façade after every
    /// successful write.
    pub fn mark_dirty(&self) {
        let now = now_secs();
        let mut state = self.state.lock();
        match *state {
            State::Building => self.mutated_during_build.store(true, Ordering::SeqCst),
            _ => *state = State::Dirty(now),
        }
    }

    /// Spawns the background worker thread. No-op if already running.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let service = Arc::clone(self);
        *handle = Some(std::thread::spawn(move || service.run_loop()));
    }

    /// Signals the worker to stop and joins it. Safe to call even if the
    /// worker was never started.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_loop(self: Arc<Self>) {
        while !self.stop.load(Ordering::SeqCst) {
            std::thread::sleep(self.config.poll_interval);
            self.tick();
        }
    }

    fn tick(&self) {
        let now = now_secs();
        let ready = {
            let mut state = self.state.lock();
            match *state {
                State::Dirty(ts) if now.saturating_sub(ts) >= self.config.quiet_period.as_secs() => {
                    *state = State::Quiescent(ts);
                    true
                }
                State::Quiescent(_) => true,
                _ => false,
            }
        };
        if ready {
            self.rebuild_once();
        }
    }

    /// Forces a synchronous rebuild regardless of quiescence — used when
    /// `background_indexing` is disabled and callers rebuild manually.
    pub fn rebuild_now(&self) -> Result<()> {
        self.rebuild_once();
        Ok(())
    }

    fn rebuild_once(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                State::Quiescent(_) | State::Dirty(_) | State::Clean => *state = State::Building,
                State::Building => return,
            }
        }
        self.mutated_during_build.store(false, Ordering::SeqCst);
        self.cancel.store(false, Ordering::SeqCst);

        let entries = match (self.snapshot_fn)() {
            Ok(entries) => entries,
            Err(err) => {
                tracing::error!(error = %err, "failed to snapshot vector store for indexing");
                *self.state.lock() = State::Dirty(now_secs());
                return;
            }
        };

        if entries.is_empty() {
            *self.state.lock() = State::Clean;
            return;
        }

        let indexes: FxHashMap<IndexKind, Box<dyn SearchIndex>> = self
            .config
            .enabled
            .par_iter()
            .filter_map(|kind| {
                if self.cancel.load(Ordering::SeqCst) {
                    return None;
                }
                self.build_one(*kind, &entries).map(|idx| (*kind, idx))
            })
            .collect();

        let tags = self.build_tag_index();

        if self.cancel.load(Ordering::SeqCst) {
            // Build was cancelled; readers keep the previously published snapshot.
            *self.state.lock() = State::Dirty(now_secs());
            return;
        }

        self.published.store(Arc::new(PublishedIndexes { indexes, tags, built_at: now_secs() }));

        let mut state = self.state.lock();
        if self.mutated_during_build.load(Ordering::SeqCst) {
            *state = State::Dirty(now_secs());
        } else {
            *state = State::Clean;
        }
    }

    fn build_one(&self, kind: IndexKind, entries: &[IndexEntry]) -> Option<Box<dyn SearchIndex>> {
        let metric = self.config.metric;
        let result: Result<Box<dyn SearchIndex>> = match kind {
            IndexKind::Linear => {
                let mut idx = LinearIndex::new(metric);
                idx.build(entries).map(|()| Box::new(idx) as Box<dyn SearchIndex>)
            }
            IndexKind::KdTree => {
                let mut idx = KdTreeIndex::new(metric).with_parallel_threshold(self.config.kd_parallel_threshold);
                idx.build(entries).map(|()| Box::new(idx) as Box<dyn SearchIndex>)
            }
            IndexKind::BallTree => {
                let mut idx = BallTreeIndex::new(metric);
                idx.build(entries).map(|()| Box::new(idx) as Box<dyn SearchIndex>)
            }
            IndexKind::Lsh => {
                let mut idx = LshIndex::new(metric);
                idx.build(entries).map(|()| Box::new(idx) as Box<dyn SearchIndex>)
            }
            IndexKind::Hnsw => {
                let hnsw = &self.config.hnsw;
                let mut idx = HnswIndex::new(metric, hnsw.m, hnsw.ef_construction, hnsw.ef, hnsw.seed);
                idx.build(entries).map(|()| Box::new(idx) as Box<dyn SearchIndex>)
            }
            IndexKind::BinaryQuantization => {
                let mut idx = BinaryQuantizationIndex::new(metric);
                idx.build(entries).map(|()| Box::new(idx) as Box<dyn SearchIndex>)
            }
            IndexKind::ProductQuantization => {
                let mut idx =
                    ProductQuantizationIndex::new(metric, self.config.pq.sub_vectors, self.config.pq.centroids);
                idx.build(entries).map(|()| Box::new(idx) as Box<dyn SearchIndex>)
            }
        };

        match result {
            Ok(idx) => Some(idx),
            Err(err) => {
                // Build failures in one index are isolated: log and continue
                // with the others; queries against a missing index fall back
                // to Linear at the database façade.
                tracing::warn!(?kind, error = %err, "index build failed, skipping this cycle");
                None
            }
        }
    }

    fn build_tag_index(&self) -> FxHashMap<u16, RoaringBitmap> {
        let mut tags: FxHashMap<u16, RoaringBitmap> = FxHashMap::default();
        for (id, tag_set) in (self.tag_fn)() {
            let low_bits = (id.0 & u128::from(u32::MAX)) as u32;
            for tag in tag_set {
                tags.entry(tag).or_default().insert(low_bits);
            }
        }
        tags
    }
}

impl Drop for IndexingService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn config(enabled: Vec<IndexKind>) -> IndexingServiceConfig {
        IndexingServiceConfig {
            metric: DistanceMetric::Euclidean,
            enabled,
            quiet_period: Duration::from_millis(0),
            poll_interval: Duration::from_millis(10),
            hnsw: HnswConfig::default(),
            pq: PqConfig { sub_vectors: 2, centroids: 8, training_sample_size: 1000 },
            kd_parallel_threshold: 1000,
        }
    }

    fn sample_entries() -> Vec<IndexEntry> {
        (0..20).map(|i| (VectorId::from_u128(i as u128), vec![i as f32, (i * 2) as f32])).collect()
    }

    #[test]
    fn rebuild_now_populates_published_indexes() {
        let entries = Arc::new(StdMutex::new(sample_entries()));
        let entries_clone = Arc::clone(&entries);
        let service = IndexingService::new(
            config(vec![IndexKind::Linear, IndexKind::KdTree]),
            move || Ok(entries_clone.lock().unwrap().clone()),
            || Vec::new(),
        );
        service.rebuild_now().unwrap();
        let published = service.published();
        assert_eq!(published.indexes.len(), 2);
        assert!(published.indexes.contains_key(&IndexKind::Linear));
        assert!(published.indexes.contains_key(&IndexKind::KdTree));
    }

    #[test]
    fn empty_store_does_not_publish_indexes() {
        let service = IndexingService::new(config(vec![IndexKind::Linear]), || Ok(Vec::new()), || Vec::new());
        service.rebuild_now().unwrap();
        assert!(service.published().indexes.is_empty());
    }

    #[test]
    fn tag_index_groups_ids_by_tag() {
        let mut tags = BTreeSet::new();
        tags.insert(7u16);
        let service = IndexingService::new(
            config(vec![IndexKind::Linear]),
            || Ok(sample_entries()),
            move || vec![(VectorId::from_u128(1), tags.clone())],
        );
        service.rebuild_now().unwrap();
        let published = service.published();
        assert!(published.tags.get(&7).is_some_and(|bitmap| bitmap.contains(1)));
    }

    #[test]
    fn mark_dirty_during_build_reschedules() {
        let service =
            IndexingService::new(config(vec![IndexKind::Linear]), || Ok(sample_entries()), || Vec::new());
        *service.state.lock() = State::Building;
        service.mark_dirty();
        assert!(service.mutated_during_build.load(Ordering::SeqCst));
    }

    #[test]
    fn start_and_shutdown_does_not_hang() {
        let service =
            IndexingService::new(config(vec![IndexKind::Linear]), || Ok(sample_entries()), || Vec::new());
        service.start();
        std::thread::sleep(Duration::from_millis(30));
        service.shutdown();
    }
}
