//! Configuration options consumed by the core (spec §6).
//!
//! Loaded with `figment` layering a TOML file over compiled-in defaults —
//! there is deliberately no environment-variable provider: the core has no
//! env-var contract, that belongs to the excluded CLI/server layers.

use crate::error::{Error, Result};
use figment::providers::{Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which index family a search should prefer, or let the façade decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAlgorithm {
    /// Heuristic dispatch, per §4.6.
    #[default]
    Auto,
    /// Brute force.
    Linear,
    /// KD-tree.
    KdTree,
    /// Ball tree.
    BallTree,
    /// Locality-sensitive hashing.
    Lsh,
    /// Hierarchical navigable small world graph.
    Hnsw,
    /// Binary quantization.
    BinaryQuantization,
    /// Product quantization.
    ProductQuantization,
}

/// HNSW construction/search parameters (spec §4.4.5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Graph out-degree (`M`).
    pub m: usize,
    /// Dynamic candidate list size used during construction.
    pub ef_construction: usize,
    /// Dynamic candidate list size used at query time.
    pub ef: usize,
    /// Seed for the level-assignment and tie-break RNG.
    pub seed: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef: 64,
            seed: 0x5DEE_CE66_D1A4_B5B5,
        }
    }
}

/// Product-quantization parameters (spec §4.4.7, §6).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PqConfig {
    /// Number of sub-vectors (`S`); the vector dimension must divide evenly.
    pub sub_vectors: usize,
    /// Centroids per sub-space (`K`), default 256 for 8-bit codes.
    pub centroids: usize,
    /// Number of store vectors sampled to train the codebooks.
    pub training_sample_size: usize,
}

impl Default for PqConfig {
    fn default() -> Self {
        Self {
            sub_vectors: 8,
            centroids: 256,
            training_sample_size: 10_000,
        }
    }
}

/// All configuration options consumed by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Minimum idle time before a background index rebuild runs.
    pub quiet_period_seconds: u64,
    /// Disables the background worker; callers must rebuild manually.
    pub background_indexing: bool,
    /// Index family used when a search does not name one explicitly.
    pub default_algorithm: DefaultAlgorithm,
    /// HNSW graph parameters.
    pub hnsw: HnswConfig,
    /// Product quantization parameters.
    pub pq: PqConfig,
    /// Vector count above which KD-tree construction parallelizes.
    pub kd_parallel_threshold: usize,
    /// Wraps `save()` output in a gzip archive.
    pub compress_on_save: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            quiet_period_seconds: 5,
            background_indexing: true,
            default_algorithm: DefaultAlgorithm::Auto,
            hnsw: HnswConfig::default(),
            pq: PqConfig::default(),
            kd_parallel_threshold: 1000,
            compress_on_save: false,
        }
    }
}

impl DatabaseConfig {
    /// Loads configuration, merging an optional TOML file over the defaults.
    /// Missing files are treated as "use the defaults".
    pub fn load(toml_path: impl AsRef<Path>) -> Result<Self> {
        let path = toml_path.as_ref();
        let figment = Figment::new().merge(Serialized::defaults(Self::default()));

        let figment = if path.exists() {
            figment.merge(Toml::file(path))
        } else {
            figment
        };

        figment
            .extract()
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = DatabaseConfig::default();
        assert_eq!(cfg.quiet_period_seconds, 5);
        assert!(cfg.background_indexing);
        assert_eq!(cfg.default_algorithm, DefaultAlgorithm::Auto);
        assert_eq!(cfg.kd_parallel_threshold, 1000);
        assert!(!cfg.compress_on_save);
        assert_eq!(cfg.pq.centroids, 256);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let cfg = DatabaseConfig::load("/nonexistent/path/veloxdb.toml").unwrap();
        assert_eq!(cfg, DatabaseConfig::default());
    }

    #[test]
    fn load_overrides_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veloxdb.toml");
        std::fs::write(&path, "quiet_period_seconds = 30\ncompress_on_save = true\n").unwrap();

        let cfg = DatabaseConfig::load(&path).unwrap();
        assert_eq!(cfg.quiet_period_seconds, 30);
        assert!(cfg.compress_on_save);
        // Untouched fields keep defaults.
        assert_eq!(cfg.kd_parallel_threshold, 1000);
    }
}
