//! Binary quantization (spec §4.4.6): one sign bit per dimension for a 32×
//! memory reduction, queried by Hamming distance with an exact rerank over
//! the shortlist. The split threshold defaults to `0.0` but is configurable
//! per index for callers that want a median-split instead.

use super::super::codec::{read_u128, read_u32, write_u128, write_u32};
use super::super::snapshot_map;
use super::{IndexEntry, SearchIndex};
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::point::{ScoredId, VectorId};
use std::cmp::Ordering;
use std::io::{Read, Write};

/// A binary-quantized vector: one bit per dimension, packed into bytes.
#[derive(Debug, Clone)]
pub struct BinaryQuantizedVector {
    data: Vec<u8>,
    dimension: usize,
}

impl BinaryQuantizedVector {
    /// Quantizes `vector` at the given `threshold` (a component at or above
    /// the threshold becomes `1`, below becomes `0`).
    ///
    /// # Panics
    ///
    /// Panics if `vector` is empty.
    #[must_use]
    pub fn from_f32(vector: &[f32], threshold: f32) -> Self {
        assert!(!vector.is_empty(), "cannot quantize an empty vector");
        let dimension = vector.len();
        let mut data = vec![0u8; dimension.div_ceil(8)];
        for (i, &value) in vector.iter().enumerate() {
            if value >= threshold {
                data[i / 8] |= 1 << (i % 8);
            }
        }
        Self { data, dimension }
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[must_use]
    pub fn memory_size(&self) -> usize {
        self.data.len()
    }

    /// Hamming distance (number of differing bits) to another quantized
    /// vector of the same dimension.
    #[must_use]
    pub fn hamming_distance(&self, other: &Self) -> u32 {
        debug_assert_eq!(self.dimension, other.dimension);
        self.data.iter().zip(other.data.iter()).map(|(&a, &b)| (a ^ b).count_ones()).sum()
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        assert!(u32::try_from(self.dimension).is_ok(), "dimension exceeds u32::MAX");
        let mut bytes = Vec::with_capacity(4 + self.data.len());
        bytes.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::CorruptHeader("binary quantized vector header truncated".into()));
        }
        let dimension = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let expected = dimension.div_ceil(8);
        if bytes.len() < 4 + expected {
            return Err(Error::CorruptHeader(format!(
                "binary quantized vector data truncated: expected {} bytes, got {}",
                4 + expected,
                bytes.len()
            )));
        }
        Ok(Self { data: bytes[4..4 + expected].to_vec(), dimension })
    }
}

/// A search index over binary-quantized vectors: Hamming distance selects a
/// shortlist, then the original full-precision metric reranks it exactly.
pub struct BinaryQuantizationIndex {
    metric: DistanceMetric,
    threshold: f32,
    entries: Vec<IndexEntry>,
    codes: Vec<BinaryQuantizedVector>,
    rerank_multiplier: usize,
}

impl BinaryQuantizationIndex {
    #[must_use]
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            threshold: 0.0,
            entries: Vec::new(),
            codes: Vec::new(),
            rerank_multiplier: 10,
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    fn shortlist(&self, query: &[f32], k: usize) -> Vec<usize> {
        let query_code = BinaryQuantizedVector::from_f32(query, self.threshold);
        let want = (k * self.rerank_multiplier).max(k).min(self.entries.len());
        let mut scored: Vec<(usize, u32)> = self
            .codes
            .iter()
            .enumerate()
            .map(|(i, code)| (i, query_code.hamming_distance(code)))
            .collect();
        scored.sort_by_key(|(_, d)| *d);
        scored.truncate(want);
        scored.into_iter().map(|(i, _)| i).collect()
    }
}

impl SearchIndex for BinaryQuantizationIndex {
    fn build(&mut self, entries: &[IndexEntry]) -> Result<()> {
        self.entries = entries.to_vec();
        self.codes = entries.iter().map(|(_, v)| BinaryQuantizedVector::from_f32(v, self.threshold)).collect();
        Ok(())
    }

    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let higher_is_closer = self.metric.higher_is_closer();
        let mut scored: Vec<(VectorId, f32)> = Vec::new();
        for idx in self.shortlist(query, k) {
            let (id, values) = &self.entries[idx];
            scored.push((*id, self.metric.scalar(query, values)?));
        }
        if higher_is_closer {
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        } else {
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        }
        scored.truncate(k);
        Ok(scored.into_iter().map(|(id, score)| ScoredId::new(id, score)).collect())
    }

    fn range(&self, query: &[f32], radius: f32) -> Result<Vec<ScoredId>> {
        let higher_is_closer = self.metric.higher_is_closer();
        let mut scored = Vec::new();
        for idx in self.shortlist(query, self.entries.len().max(1)) {
            let (id, values) = &self.entries[idx];
            let d = self.metric.scalar(query, values)?;
            if (higher_is_closer && d >= radius) || (!higher_is_closer && d <= radius) {
                scored.push((*id, d));
            }
        }
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        Ok(scored.into_iter().map(|(id, score)| ScoredId::new(id, score)).collect())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Threshold, rerank multiplier, entry ids (values via snapshot), then
    /// each quantized code via [`BinaryQuantizedVector::to_bytes`].
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        writer.write_all(&self.threshold.to_le_bytes())?;
        write_u32(writer, self.rerank_multiplier as u32)?;

        write_u32(writer, self.entries.len() as u32)?;
        for (id, _) in &self.entries {
            write_u128(writer, id.0)?;
        }

        write_u32(writer, self.codes.len() as u32)?;
        for code in &self.codes {
            let bytes = code.to_bytes();
            write_u32(writer, bytes.len() as u32)?;
            writer.write_all(&bytes)?;
        }
        Ok(())
    }

    fn load(&mut self, reader: &mut dyn Read, snapshot: &[IndexEntry]) -> Result<()> {
        let map = snapshot_map(snapshot);

        let mut threshold_bytes = [0u8; 4];
        reader
            .read_exact(&mut threshold_bytes)
            .map_err(|_| Error::CorruptHeader("binary quantization snapshot truncated".into()))?;
        self.threshold = f32::from_le_bytes(threshold_bytes);
        self.rerank_multiplier = read_u32(reader)? as usize;

        let entry_count = read_u32(reader)? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let id = read_u128(reader)?;
            let values = super::super::resolve(&map, id)?;
            entries.push((VectorId::from_u128(id), values));
        }

        let code_count = read_u32(reader)? as usize;
        let mut codes = Vec::with_capacity(code_count);
        for _ in 0..code_count {
            let len = read_u32(reader)? as usize;
            let mut bytes = vec![0u8; len];
            reader
                .read_exact(&mut bytes)
                .map_err(|_| Error::CorruptHeader("binary quantization code truncated".into()))?;
            codes.push(BinaryQuantizedVector::from_bytes(&bytes)?);
        }

        self.entries = entries;
        self.codes = codes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_32x_smaller_than_f32() {
        let v: Vec<f32> = (0..768).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let code = BinaryQuantizedVector::from_f32(&v, 0.0);
        assert_eq!(code.memory_size(), 768 / 8);
        assert_eq!(v.len() * 4 / code.memory_size(), 32);
    }

    #[test]
    fn identical_vectors_have_zero_hamming_distance() {
        let v = vec![1.0, -1.0, 2.0, -3.0];
        let a = BinaryQuantizedVector::from_f32(&v, 0.0);
        let b = BinaryQuantizedVector::from_f32(&v, 0.0);
        assert_eq!(a.hamming_distance(&b), 0);
    }

    #[test]
    fn bytes_round_trip() {
        let v = vec![1.0, -1.0, 2.0, -3.0, 5.0];
        let code = BinaryQuantizedVector::from_f32(&v, 0.0);
        let bytes = code.to_bytes();
        let decoded = BinaryQuantizedVector::from_bytes(&bytes).unwrap();
        assert_eq!(code.hamming_distance(&decoded), 0);
        assert_eq!(decoded.dimension(), 5);
    }

    #[test]
    fn from_bytes_rejects_truncated_input() {
        assert!(BinaryQuantizedVector::from_bytes(&[0, 0]).is_err());
    }

    fn entries() -> Vec<IndexEntry> {
        (0..100)
            .map(|i| (VectorId::from_u128(i as u128), vec![i as f32, -(i as f32), (i as f32) * 0.5]))
            .collect()
    }

    #[test]
    fn nearest_recovers_exact_match() {
        let mut idx = BinaryQuantizationIndex::new(DistanceMetric::Euclidean);
        idx.build(&entries()).unwrap();
        let result = idx.nearest(&[50.0, -50.0, 25.0], 1).unwrap();
        assert_eq!(result[0].id, VectorId::from_u128(50));
    }

    #[test]
    fn range_respects_radius_after_rerank() {
        let mut idx = BinaryQuantizationIndex::new(DistanceMetric::Euclidean);
        idx.build(&entries()).unwrap();
        let result = idx.range(&[0.0, 0.0, 0.0], 1.5).unwrap();
        for r in &result {
            assert!(r.score <= 1.5);
        }
    }

    #[test]
    fn save_load_round_trip() {
        let mut idx = BinaryQuantizationIndex::new(DistanceMetric::Euclidean);
        idx.build(&entries()).unwrap();
        let mut bytes = Vec::new();
        idx.save(&mut bytes).unwrap();

        let mut reloaded = BinaryQuantizationIndex::new(DistanceMetric::Euclidean);
        reloaded.load(&mut bytes.as_slice(), &entries()).unwrap();
        assert_eq!(reloaded.len(), idx.len());
        let result = reloaded.nearest(&[50.0, -50.0, 25.0], 1).unwrap();
        assert_eq!(result[0].id, VectorId::from_u128(50));
    }
}
