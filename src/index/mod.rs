//! Search index family (spec §4.4): linear, KD-tree, ball tree, LSH, HNSW,
//! and the two quantization-based indexes, all behind one shared trait so
//! the database façade and indexing service can treat them uniformly.

pub mod balltree;
pub mod hnsw;
pub mod kdtree;
pub mod linear;
pub mod lsh;
pub mod quantization;

use crate::error::{Error, Result};
use crate::point::{ScoredId, VectorId};
use std::io::{Read, Write};

/// A vector paired with its identifier, the unit every index builds from.
pub type IndexEntry = (VectorId, Vec<f32>);

/// Shared surface implemented by every search index family.
///
/// `build` replaces the index's contents; indexes are otherwise immutable —
/// the indexing service (spec §4.5) is responsible for scheduling rebuilds
/// rather than any index supporting incremental mutation itself.
pub trait SearchIndex: Send + Sync {
    /// Rebuilds the index from scratch over `entries`.
    fn build(&mut self, entries: &[IndexEntry]) -> Result<()>;

    /// Returns the `k` nearest neighbors to `query`, best first.
    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>>;

    /// Returns every indexed vector within `radius` of `query`, best first.
    fn range(&self, query: &[f32], radius: f32) -> Result<Vec<ScoredId>>;

    /// Number of vectors currently indexed.
    fn len(&self) -> usize;

    /// `true` if no vectors are indexed.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes this index's structure to `writer`. Most formats persist
    /// only identifiers and structural metadata, not duplicate float data —
    /// `load` resolves vector values back from a snapshot.
    fn save(&self, writer: &mut dyn Write) -> Result<()>;

    /// Reconstructs this index from bytes previously produced by [`Self::save`],
    /// resolving each persisted identifier's vector values from `snapshot`.
    fn load(&mut self, reader: &mut dyn Read, snapshot: &[IndexEntry]) -> Result<()>;
}

/// Builds an id-to-values lookup table for `load` implementations that persist
/// only identifiers and must resolve vector data from the rebuild snapshot.
pub(crate) fn snapshot_map(snapshot: &[IndexEntry]) -> rustc_hash::FxHashMap<u128, Vec<f32>> {
    snapshot.iter().map(|(id, values)| (id.0, values.clone())).collect()
}

fn missing_id(id: u128) -> Error {
    Error::CorruptHeader(format!("id {id} not present in rebuild snapshot"))
}

/// Looks up `id`'s vector in a snapshot map built by [`snapshot_map`].
pub(crate) fn resolve(
    map: &rustc_hash::FxHashMap<u128, Vec<f32>>,
    id: u128,
) -> Result<Vec<f32>> {
    map.get(&id).cloned().ok_or_else(|| missing_id(id))
}

pub(crate) mod codec {
    //! Small hand-rolled binary primitives shared by every index's
    //! `save`/`load`, matching [`crate::point::VectorRecord`]'s own
    //! length-prefixed, little-endian binary style rather than reaching for
    //! serde/bincode for this internal format.
    use crate::error::{Error, Result};
    use std::io::{Read, Write};

    pub fn write_u8(w: &mut dyn Write, v: u8) -> Result<()> {
        Ok(w.write_all(&[v])?)
    }
    pub fn write_u32(w: &mut dyn Write, v: u32) -> Result<()> {
        Ok(w.write_all(&v.to_le_bytes())?)
    }
    pub fn write_u64(w: &mut dyn Write, v: u64) -> Result<()> {
        Ok(w.write_all(&v.to_le_bytes())?)
    }
    pub fn write_u128(w: &mut dyn Write, v: u128) -> Result<()> {
        Ok(w.write_all(&v.to_le_bytes())?)
    }
    pub fn write_f32(w: &mut dyn Write, v: f32) -> Result<()> {
        Ok(w.write_all(&v.to_le_bytes())?)
    }
    pub fn write_bytes(w: &mut dyn Write, v: &[u8]) -> Result<()> {
        Ok(w.write_all(v)?)
    }

    fn truncated() -> Error {
        Error::CorruptHeader("index snapshot truncated".into())
    }

    pub fn read_u8(r: &mut dyn Read) -> Result<u8> {
        let mut buf = [0u8; 1];
        r.read_exact(&mut buf).map_err(|_| truncated())?;
        Ok(buf[0])
    }
    pub fn read_u32(r: &mut dyn Read) -> Result<u32> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).map_err(|_| truncated())?;
        Ok(u32::from_le_bytes(buf))
    }
    pub fn read_u64(r: &mut dyn Read) -> Result<u64> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf).map_err(|_| truncated())?;
        Ok(u64::from_le_bytes(buf))
    }
    pub fn read_u128(r: &mut dyn Read) -> Result<u128> {
        let mut buf = [0u8; 16];
        r.read_exact(&mut buf).map_err(|_| truncated())?;
        Ok(u128::from_le_bytes(buf))
    }
    pub fn read_f32(r: &mut dyn Read) -> Result<f32> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).map_err(|_| truncated())?;
        Ok(f32::from_le_bytes(buf))
    }
    pub fn read_vec(r: &mut dyn Read, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        r.read_exact(&mut buf).map_err(|_| truncated())?;
        Ok(buf)
    }
}
