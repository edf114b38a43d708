//! Vector record type and its byte-exact binary interchange format (spec §3).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A stable, 128-bit vector identifier.
///
/// Assigned on first insert; preserved across `update`. Wraps a [`Uuid`] so
/// callers get a standard, collision-resistant 128-bit value without the
/// core needing its own ID allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VectorId(pub u128);

impl VectorId {
    /// Generates a new random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().as_u128())
    }

    /// Wraps an existing 128-bit value (e.g. one read back off disk).
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }
}

impl Default for VectorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VectorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_u128(self.0))
    }
}

/// A small unordered set of 16-bit tag identifiers attached to a vector.
pub type TagSet = BTreeSet<u16>;

/// A vector record: identifier, values, tags, and optional source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Stable 128-bit identifier. `None` until the record has been inserted.
    pub id: Option<VectorId>,
    /// The vector's floating-point components.
    pub values: Vec<f32>,
    /// Tag identifiers attached to this vector.
    pub tags: TagSet,
    /// Optional original source text, may be empty.
    pub text: Option<String>,
}

impl VectorRecord {
    /// Builds a record with no tags or text.
    #[must_use]
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            id: None,
            values,
            tags: TagSet::new(),
            text: None,
        }
    }

    /// Builds a record with the given tags.
    #[must_use]
    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    /// Builds a record with the given source text.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Returns the dimension (number of components) of this vector.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Encodes this record in the canonical binary interchange form:
    /// `[16-byte id][4-byte dimension][dimension×4-byte LE floats]
    ///  [2-byte tag-count][tag-count×2-byte tags][4-byte text-length][text bytes]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NullInput`] if `id` has not been assigned yet —
    /// the binary form is the on-disk/wire interchange form and always
    /// carries a concrete identifier.
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        let id = self.id.ok_or(Error::NullInput)?;
        let text_bytes = self.text.as_deref().unwrap_or("").as_bytes();

        let mut buf = Vec::with_capacity(
            16 + 4 + self.values.len() * 4 + 2 + self.tags.len() * 2 + 4 + text_bytes.len(),
        );

        buf.extend_from_slice(&id.0.to_le_bytes());
        buf.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&(self.tags.len() as u16).to_le_bytes());
        for tag in &self.tags {
            buf.extend_from_slice(&tag.to_le_bytes());
        }
        buf.extend_from_slice(&(text_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(text_bytes);

        Ok(buf)
    }

    /// Decodes a record previously produced by [`Self::to_binary`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptHeader`] if `bytes` is too short for any
    /// length-prefixed field it claims to contain.
    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        fn take<'b>(bytes: &'b [u8], cursor: &mut usize, n: usize) -> Result<&'b [u8]> {
            let start = *cursor;
            let end = start
                .checked_add(n)
                .ok_or_else(|| Error::CorruptHeader("length overflow".into()))?;
            if end > bytes.len() {
                return Err(Error::CorruptHeader(format!(
                    "expected {n} more bytes at offset {start}, only {} available",
                    bytes.len().saturating_sub(start)
                )));
            }
            *cursor = end;
            Ok(&bytes[start..end])
        }

        let mut cursor = 0usize;
        let take = |cursor: &mut usize, n: usize| take(bytes, cursor, n);

        let id_bytes = take(&mut cursor, 16)?;
        let id = VectorId(u128::from_le_bytes(id_bytes.try_into().unwrap()));

        let dim_bytes = take(&mut cursor, 4)?;
        let dimension = u32::from_le_bytes(dim_bytes.try_into().unwrap()) as usize;

        let mut values = Vec::with_capacity(dimension);
        for _ in 0..dimension {
            let v_bytes = take(&mut cursor, 4)?;
            values.push(f32::from_le_bytes(v_bytes.try_into().unwrap()));
        }

        let tag_count_bytes = take(&mut cursor, 2)?;
        let tag_count = u16::from_le_bytes(tag_count_bytes.try_into().unwrap()) as usize;
        let mut tags = TagSet::new();
        for _ in 0..tag_count {
            let tag_bytes = take(&mut cursor, 2)?;
            tags.insert(u16::from_le_bytes(tag_bytes.try_into().unwrap()));
        }

        let text_len_bytes = take(&mut cursor, 4)?;
        let text_len = u32::from_le_bytes(text_len_bytes.try_into().unwrap()) as usize;
        let text_bytes = take(&mut cursor, text_len)?;
        let text = if text_bytes.is_empty() {
            None
        } else {
            Some(
                String::from_utf8(text_bytes.to_vec())
                    .map_err(|e| Error::CorruptHeader(e.to_string()))?,
            )
        };

        Ok(Self {
            id: Some(id),
            values,
            tags,
            text,
        })
    }
}

/// Equality is identifier, dimension, and values bytewise — tags and source
/// text are metadata, not part of the vector's identity.
impl PartialEq for VectorRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.values == other.values
    }
}

/// A single nearest-neighbor result: the matched identifier and its distance
/// (or similarity, for cosine) to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredId {
    /// The matched vector's identifier.
    pub id: VectorId,
    /// Distance (or similarity) to the query, per the metric in use.
    pub score: f32,
}

impl ScoredId {
    /// Builds a new scored result.
    #[must_use]
    pub fn new(id: VectorId, score: f32) -> Self {
        Self { id, score }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VectorRecord {
        let mut tags = TagSet::new();
        tags.insert(1);
        tags.insert(7);
        VectorRecord {
            id: Some(VectorId(12345)),
            values: vec![1.0, 2.0, 3.0],
            tags,
            text: Some("hello".into()),
        }
    }

    #[test]
    fn binary_round_trip() {
        let record = sample();
        let bytes = record.to_binary().unwrap();
        let decoded = VectorRecord::from_binary(&bytes).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn binary_round_trip_empty_text_and_tags() {
        let record = VectorRecord {
            id: Some(VectorId(1)),
            values: vec![0.5, -0.5],
            tags: TagSet::new(),
            text: None,
        };
        let bytes = record.to_binary().unwrap();
        let decoded = VectorRecord::from_binary(&bytes).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn to_binary_requires_id() {
        let record = VectorRecord::new(vec![1.0]);
        assert!(matches!(record.to_binary(), Err(Error::NullInput)));
    }

    #[test]
    fn from_binary_rejects_truncated_input() {
        let record = sample();
        let mut bytes = record.to_binary().unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            VectorRecord::from_binary(&bytes),
            Err(Error::CorruptHeader(_))
        ));
    }

    #[test]
    fn equality_is_id_dimension_and_values_bytewise() {
        let a = VectorRecord {
            id: Some(VectorId(1)),
            values: vec![1.0, 2.0],
            tags: TagSet::new(),
            text: None,
        };
        let mut b = a.clone();
        b.text = Some("differs only in metadata".into());
        b.tags.insert(9);
        assert_eq!(a, b);

        let mut c = a.clone();
        c.values[0] = 9.0;
        assert_ne!(a, c);
    }
}
