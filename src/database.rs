//! Database façade (spec §4.6): the single entry point tying the vector
//! store, metadata filter, and search indexes together behind heuristic
//! index dispatch.
//!
//! Arbitrary JSON metadata is kept apart from [`VectorRecord`]'s byte-exact
//! wire format (which carries only tags and optional source text) in a
//! side map keyed by vector id, persisted as its own file rather than
//! folded into the record itself.

use crate::config::DatabaseConfig;
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::filter::Condition;
use crate::index::linear::LinearIndex;
use crate::index::{IndexEntry, SearchIndex};
use crate::indexing_service::{IndexKind, IndexingService, IndexingServiceConfig};
use crate::point::{ScoredId, TagSet, VectorId, VectorRecord};
use crate::storage::VectorStore;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// How far past `k` a filtered search overshoots the underlying index before
/// applying [`Condition::evaluate`], since the index itself has no notion of
/// the metadata payload.
const FILTER_OVERSAMPLE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchKind {
    Nearest,
    Range,
}

fn snapshot_from_store(store: &VectorStore) -> Result<Vec<IndexEntry>> {
    Ok(store
        .iterate_live()?
        .into_iter()
        .filter_map(|r| r.id.map(|id| (id, r.values)))
        .collect())
}

fn tags_from_store(store: &VectorStore) -> Vec<(VectorId, BTreeSet<u16>)> {
    store
        .iterate_live()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|r| r.id.map(|id| (id, r.tags)))
        .collect()
}

fn enabled_kinds(config: &DatabaseConfig) -> Vec<IndexKind> {
    if let Some(explicit) = IndexKind::from_algorithm(config.default_algorithm) {
        vec![explicit, IndexKind::Linear]
    } else {
        vec![
            IndexKind::Linear,
            IndexKind::KdTree,
            IndexKind::BallTree,
            IndexKind::Lsh,
            IndexKind::Hnsw,
            IndexKind::BinaryQuantization,
            IndexKind::ProductQuantization,
        ]
    }
}

fn metadata_path(path: &Path) -> PathBuf {
    path.join("metadata.bin")
}

fn metadata_gz_path(path: &Path) -> PathBuf {
    path.join("metadata.bin.gz")
}

fn load_metadata(path: &Path) -> Result<FxHashMap<u128, Value>> {
    let gz_path = metadata_gz_path(path);
    if gz_path.exists() {
        let file = std::fs::File::open(&gz_path)?;
        let mut decoder = GzDecoder::new(file);
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;
        return bincode::deserialize(&bytes).map_err(|e| Error::CorruptHeader(e.to_string()));
    }
    let plain_path = metadata_path(path);
    if plain_path.exists() {
        let bytes = std::fs::read(&plain_path)?;
        return bincode::deserialize(&bytes).map_err(|e| Error::CorruptHeader(e.to_string()));
    }
    Ok(FxHashMap::default())
}

fn config_path(path: &Path) -> PathBuf {
    path.join("config.toml")
}

/// The embeddable vector database core: add/update/remove/get/search over a
/// single collection of equal-dimension vectors, with a background service
/// keeping the search indexes current.
pub struct Database {
    store: Arc<RwLock<VectorStore>>,
    metadata: Arc<RwLock<FxHashMap<u128, Value>>>,
    indexing: Arc<IndexingService>,
    config: DatabaseConfig,
    metric: DistanceMetric,
    dimension: usize,
    path: PathBuf,
}

impl Database {
    /// Opens (or creates) a database at `path`, loading `config.toml` from
    /// that directory if present and falling back to defaults otherwise.
    pub fn open(path: impl AsRef<Path>, dimension: usize, metric: DistanceMetric) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let config = DatabaseConfig::load(config_path(&path))?;
        Self::open_with_config(path, dimension, metric, config)
    }

    /// Opens (or creates) a database at `path` with an explicit, already
    /// resolved configuration instead of reading `config.toml`.
    pub fn open_with_config(
        path: PathBuf,
        dimension: usize,
        metric: DistanceMetric,
        config: DatabaseConfig,
    ) -> Result<Self> {
        std::fs::create_dir_all(&path)?;
        let store = Arc::new(RwLock::new(VectorStore::open(&path, dimension)?));
        let metadata = Arc::new(RwLock::new(load_metadata(&path)?));

        let service_config = IndexingServiceConfig {
            metric,
            enabled: enabled_kinds(&config),
            quiet_period: Duration::from_secs(config.quiet_period_seconds),
            poll_interval: Duration::from_millis(500),
            hnsw: config.hnsw,
            pq: config.pq,
            kd_parallel_threshold: config.kd_parallel_threshold,
        };

        let snapshot_store = Arc::clone(&store);
        let snapshot_fn = move || snapshot_from_store(&snapshot_store.read());
        let tag_store = Arc::clone(&store);
        let tag_fn = move || tags_from_store(&tag_store.read());

        let indexing = IndexingService::new(service_config, snapshot_fn, tag_fn);
        // Make search usable immediately on open rather than waiting out the
        // first quiet period; subsequent rebuilds follow the configured
        // policy below.
        indexing.rebuild_now()?;
        if config.background_indexing {
            indexing.start();
        }

        Ok(Self { store, metadata, indexing, config, metric, dimension, path })
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Inserts a new vector, returning its freshly assigned identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if `values` doesn't match the
    /// database's configured dimension.
    pub fn add(
        &self,
        values: Vec<f32>,
        tags: TagSet,
        text: Option<String>,
        payload: Option<Value>,
    ) -> Result<VectorId> {
        let record = VectorRecord { id: None, values, tags, text };
        let id = self.store.write().add(record)?;
        if let Some(payload) = payload {
            self.metadata.write().insert(id.0, payload);
        }
        self.indexing.mark_dirty();
        Ok(id)
    }

    /// Replaces the record stored under `id`, keeping its identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` isn't present, or
    /// [`Error::DimensionMismatch`] if `values` doesn't match.
    pub fn update(
        &self,
        id: VectorId,
        values: Vec<f32>,
        tags: TagSet,
        text: Option<String>,
        payload: Option<Value>,
    ) -> Result<()> {
        let record = VectorRecord { id: Some(id), values, tags, text };
        self.store.write().update(id, record)?;
        let mut metadata = self.metadata.write();
        if let Some(payload) = payload {
            metadata.insert(id.0, payload);
        } else {
            metadata.remove(&id.0);
        }
        drop(metadata);
        self.indexing.mark_dirty();
        Ok(())
    }

    /// Removes the record stored under `id`. Returns `true` if it was present.
    pub fn remove(&self, id: VectorId) -> Result<bool> {
        let removed = self.store.write().remove(id)?;
        if removed {
            self.metadata.write().remove(&id.0);
            self.indexing.mark_dirty();
        }
        Ok(removed)
    }

    /// Fetches a copy of the record stored under `id`.
    pub fn get(&self, id: VectorId) -> Result<Option<VectorRecord>> {
        self.store.read().get(id)
    }

    /// Fetches the arbitrary JSON metadata attached to `id`, if any.
    #[must_use]
    pub fn get_payload(&self, id: VectorId) -> Option<Value> {
        self.metadata.read().get(&id.0).cloned()
    }

    /// Forces an immediate, synchronous index rebuild. Primarily useful when
    /// `background_indexing` is disabled and the caller rebuilds manually.
    pub fn rebuild_indexes(&self) -> Result<()> {
        self.indexing.rebuild_now()
    }

    /// Flushes the vector store, persists metadata and configuration to
    /// disk, and truncates the write-ahead log. Safe to call repeatedly.
    pub fn save(&self) -> Result<()> {
        self.store.write().save()?;
        self.persist_metadata()?;
        self.persist_config()?;
        Ok(())
    }

    fn persist_metadata(&self) -> Result<()> {
        let metadata = self.metadata.read();
        let bytes = bincode::serialize(&*metadata).map_err(|e| Error::CorruptHeader(e.to_string()))?;
        drop(metadata);

        if self.config.compress_on_save {
            let file = std::fs::File::create(metadata_gz_path(&self.path))?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&bytes)?;
            encoder.finish()?;
            let _ = std::fs::remove_file(metadata_path(&self.path));
        } else {
            std::fs::write(metadata_path(&self.path), bytes)?;
            let _ = std::fs::remove_file(metadata_gz_path(&self.path));
        }
        Ok(())
    }

    fn persist_config(&self) -> Result<()> {
        let rendered = toml::to_string(&self.config).map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        std::fs::write(config_path(&self.path), rendered)?;
        Ok(())
    }

    /// Heuristic index dispatch (spec §4.6): linear below 1000 vectors,
    /// KD-tree for low dimension, HNSW once both the dimension and the
    /// count cross their thresholds, LSH for high-dimensional range
    /// queries, and ball tree as the remaining high-dimension/low-count
    /// middle ground. An explicit `default_algorithm` in configuration
    /// always wins over the heuristic.
    fn choose_index_kind(&self, kind: SearchKind) -> IndexKind {
        if let Some(explicit) = IndexKind::from_algorithm(self.config.default_algorithm) {
            return explicit;
        }
        let count = self.len();
        let dimension = self.dimension;
        if count < 1000 {
            return IndexKind::Linear;
        }
        if dimension < 20 {
            return IndexKind::KdTree;
        }
        if kind == SearchKind::Range {
            return IndexKind::Lsh;
        }
        if count >= 10_000 {
            return IndexKind::Hnsw;
        }
        IndexKind::BallTree
    }

    fn linear_fallback(&self) -> Result<LinearIndex> {
        let entries = snapshot_from_store(&self.store.read())?;
        let mut index = LinearIndex::new(self.metric);
        index.build(&entries)?;
        Ok(index)
    }

    /// Finds the `k` nearest neighbors of `query`, optionally restricted to
    /// records whose metadata satisfies `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if `query`'s length doesn't match
    /// the database's configured dimension.
    pub fn search(&self, query: &[f32], k: usize, filter: Option<&Condition>) -> Result<Vec<ScoredId>> {
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch { expected: self.dimension, actual: query.len() });
        }
        let kind = self.choose_index_kind(SearchKind::Nearest);

        if let Some(condition) = filter {
            if kind == IndexKind::Linear {
                return self.filtered_linear_nearest(query, k, condition);
            }
        }

        let want = match filter {
            None => k,
            Some(_) => k.saturating_mul(FILTER_OVERSAMPLE).max(k).min(self.len().max(1)),
        };

        let published = self.indexing.published();
        let candidates = if let Some(index) = published.indexes.get(&kind) {
            index.nearest(query, want)?
        } else {
            self.linear_fallback()?.nearest(query, want)?
        };

        Ok(match filter {
            None => candidates,
            Some(condition) => self.apply_filter(candidates, condition).into_iter().take(k).collect(),
        })
    }

    /// Filters during the full scan itself rather than oversampling then
    /// post-filtering, since a linear index already enumerates every
    /// vector — there's no candidate set to have under- or over-sampled.
    fn filtered_linear_nearest(&self, query: &[f32], k: usize, condition: &Condition) -> Result<Vec<ScoredId>> {
        let higher_is_closer = self.metric.higher_is_closer();
        let mut scored = self.scan_filtered(query, condition)?;
        if higher_is_closer {
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        }
        scored.truncate(k);
        Ok(scored.into_iter().map(|(id, score)| ScoredId::new(id, score)).collect())
    }

    /// Finds every record within `radius` of `query`, optionally restricted
    /// to records whose metadata satisfies `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if `query`'s length doesn't match
    /// the database's configured dimension.
    pub fn range_search(&self, query: &[f32], radius: f32, filter: Option<&Condition>) -> Result<Vec<ScoredId>> {
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch { expected: self.dimension, actual: query.len() });
        }
        let kind = self.choose_index_kind(SearchKind::Range);

        if let Some(condition) = filter {
            if kind == IndexKind::Linear {
                return self.filtered_linear_range(query, radius, condition);
            }
        }

        let published = self.indexing.published();
        let candidates = if let Some(index) = published.indexes.get(&kind) {
            index.range(query, radius)?
        } else {
            self.linear_fallback()?.range(query, radius)?
        };

        Ok(match filter {
            None => candidates,
            Some(condition) => self.apply_filter(candidates, condition),
        })
    }

    fn filtered_linear_range(&self, query: &[f32], radius: f32, condition: &Condition) -> Result<Vec<ScoredId>> {
        let higher_is_closer = self.metric.higher_is_closer();
        let mut scored: Vec<(VectorId, f32)> = self
            .scan_filtered(query, condition)?
            .into_iter()
            .filter(|(_, d)| if higher_is_closer { *d >= radius } else { *d <= radius })
            .collect();
        if higher_is_closer {
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        } else {
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        }
        Ok(scored.into_iter().map(|(id, score)| ScoredId::new(id, score)).collect())
    }

    /// Scans every live record, keeping only those whose metadata satisfies
    /// `condition`, and scores the survivors against `query`.
    fn scan_filtered(&self, query: &[f32], condition: &Condition) -> Result<Vec<(VectorId, f32)>> {
        let store = self.store.read();
        let metadata = self.metadata.read();
        let mut scored = Vec::new();
        for record in store.iterate_live()? {
            let Some(id) = record.id else { continue };
            let payload = metadata.get(&id.0).cloned().unwrap_or(Value::Null);
            if !condition.evaluate(&payload) {
                continue;
            }
            let d = self.metric.scalar(query, &record.values)?;
            scored.push((id, d));
        }
        Ok(scored)
    }

    fn apply_filter(&self, candidates: Vec<ScoredId>, condition: &Condition) -> Vec<ScoredId> {
        let metadata = self.metadata.read();
        candidates
            .into_iter()
            .filter(|scored| {
                let payload = metadata.get(&scored.id.0).cloned().unwrap_or(Value::Null);
                condition.evaluate(&payload)
            })
            .collect()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.indexing.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open(dim: usize) -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path(), dim, DistanceMetric::Euclidean).unwrap();
        (dir, db)
    }

    #[test]
    fn add_and_get_round_trip() {
        let (_dir, db) = open(3);
        let id = db.add(vec![1.0, 2.0, 3.0], TagSet::new(), None, None).unwrap();
        let fetched = db.get(id).unwrap().unwrap();
        assert_eq!(fetched.values, vec![1.0, 2.0, 3.0]);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn search_finds_nearest() {
        let (_dir, db) = open(2);
        let mut closest = None;
        for i in 0..50 {
            let id = db.add(vec![i as f32, 0.0], TagSet::new(), None, None).unwrap();
            if i == 10 {
                closest = Some(id);
            }
        }
        let results = db.search(&[10.0, 0.0], 1, None).unwrap();
        assert_eq!(results[0].id, closest.unwrap());
    }

    #[test]
    fn dimension_mismatch_on_search_errors() {
        let (_dir, db) = open(3);
        assert!(matches!(
            db.search(&[1.0, 2.0], 1, None),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn update_replaces_values() {
        let (_dir, db) = open(2);
        let id = db.add(vec![1.0, 1.0], TagSet::new(), None, None).unwrap();
        db.update(id, vec![9.0, 9.0], TagSet::new(), None, None).unwrap();
        assert_eq!(db.get(id).unwrap().unwrap().values, vec![9.0, 9.0]);
    }

    #[test]
    fn remove_deletes_record_and_payload() {
        let (_dir, db) = open(2);
        let id = db.add(vec![1.0, 1.0], TagSet::new(), None, Some(json!({"a": 1}))).unwrap();
        assert!(db.remove(id).unwrap());
        assert!(db.get(id).unwrap().is_none());
        assert!(db.get_payload(id).is_none());
    }

    #[test]
    fn filtered_search_respects_condition() {
        let (_dir, db) = open(2);
        for i in 0..20 {
            let category = if i % 2 == 0 { "even" } else { "odd" };
            db.add(
                vec![i as f32, 0.0],
                TagSet::new(),
                None,
                Some(json!({ "category": category })),
            )
            .unwrap();
        }
        let filter = Condition::eq("category", "odd");
        let results = db.search(&[0.0, 0.0], 5, Some(&filter)).unwrap();
        assert!(!results.is_empty());
        for r in &results {
            let payload = db.get_payload(r.id).unwrap();
            assert_eq!(payload["category"], "odd");
        }
    }

    #[test]
    fn filtered_search_returns_up_to_k_matches_not_oversample_leftovers() {
        let (_dir, db) = open(2);
        let mut rare_id = None;
        for i in 0..50 {
            let category = if i == 3 { "rare" } else { "common" };
            let id =
                db.add(vec![i as f32, 0.0], TagSet::new(), None, Some(json!({ "category": category }))).unwrap();
            if i == 3 {
                rare_id = Some(id);
            }
        }
        let filter = Condition::eq("category", "rare");
        let results = db.search(&[0.0, 0.0], 5, Some(&filter)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, rare_id.unwrap());
    }

    #[test]
    fn filtered_range_search_scans_every_matching_record() {
        let (_dir, db) = open(2);
        for i in 0..30 {
            let category = if i % 3 == 0 { "keep" } else { "drop" };
            db.add(vec![i as f32, 0.0], TagSet::new(), None, Some(json!({ "category": category }))).unwrap();
        }
        let filter = Condition::eq("category", "keep");
        let results = db.range_search(&[0.0, 0.0], 15.0, Some(&filter)).unwrap();
        for r in &results {
            let payload = db.get_payload(r.id).unwrap();
            assert_eq!(payload["category"], "keep");
            assert!(r.score <= 15.0);
        }
        assert!(results.len() >= 5);
    }

    #[test]
    fn save_and_reopen_round_trips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let db = Database::open(dir.path(), 2, DistanceMetric::Euclidean).unwrap();
            let id = db.add(vec![1.0, 2.0], TagSet::new(), None, Some(json!({"k": "v"}))).unwrap();
            db.save().unwrap();
            id
        };
        let db = Database::open(dir.path(), 2, DistanceMetric::Euclidean).unwrap();
        assert_eq!(db.get_payload(id).unwrap()["k"], "v");
    }

    #[test]
    fn compressed_save_round_trips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DatabaseConfig::default();
        config.compress_on_save = true;
        let id = {
            let db = Database::open_with_config(dir.path().to_path_buf(), 2, DistanceMetric::Euclidean, config)
                .unwrap();
            let id = db.add(vec![1.0, 2.0], TagSet::new(), None, Some(json!({"k": "v"}))).unwrap();
            db.save().unwrap();
            id
        };
        assert!(metadata_gz_path(dir.path()).exists());
        let db = Database::open(dir.path(), 2, DistanceMetric::Euclidean).unwrap();
        assert_eq!(db.get_payload(id).unwrap()["k"], "v");
    }
}
