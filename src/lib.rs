//! # `veloxdb-core`
//!
//! Embeddable vector database core: memory-mapped persistent storage,
//! pluggable distance kernels, a family of nearest-neighbor search indexes,
//! and a background service that keeps them current.
//!
//! This crate is deliberately scoped to the storage-and-search engine. It
//! does not expose a network server, an ingestion/ETL pipeline, a telemetry
//! endpoint, multi-node replication, transactions, a query language, or
//! user/role management — those are the concern of layers built on top.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use veloxdb_core::{Database, DistanceMetric};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::open("./data", 768, DistanceMetric::Cosine)?;
//!
//!     let id = db.add(vec![0.1; 768], Default::default(), None, None)?;
//!     let results = db.search(&vec![0.1; 768], 10, None)?;
//!     assert!(results.iter().any(|r| r.id == id));
//!
//!     db.save()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod database;
pub mod distance;
pub mod error;
pub mod filter;
pub mod index;
pub mod indexing_service;
pub mod point;
pub(crate) mod rng;
pub mod storage;

pub use config::{DatabaseConfig, DefaultAlgorithm, HnswConfig, PqConfig};
pub use database::Database;
pub use distance::DistanceMetric;
pub use error::{Error, Result};
pub use filter::Condition;
pub use indexing_service::IndexKind;
pub use point::{ScoredId, TagSet, VectorId, VectorRecord};
