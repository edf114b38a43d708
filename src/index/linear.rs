//! Brute-force linear scan index (spec §4.4.1): the baseline every other
//! index is checked against, and the correct fallback for small stores.

use super::codec::{read_u128, read_u32, write_u128, write_u32};
use super::{snapshot_map, IndexEntry, SearchIndex};
use crate::distance::DistanceMetric;
use crate::error::Result;
use crate::point::{ScoredId, VectorId};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::io::{Read, Write};

/// Brute-force nearest-neighbor search over every stored vector.
pub struct LinearIndex {
    metric: DistanceMetric,
    entries: Vec<IndexEntry>,
    /// Above this many vectors, `nearest`/`range` partition work across
    /// `rayon` threads and merge; below it, a single-threaded scan wins.
    parallel_threshold: usize,
}

impl LinearIndex {
    #[must_use]
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            entries: Vec::new(),
            parallel_threshold: 10_000,
        }
    }

    #[must_use]
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    fn scored(&self, query: &[f32]) -> Result<Vec<(VectorId, f32)>> {
        if self.entries.len() >= self.parallel_threshold {
            self.entries
                .par_iter()
                .map(|(id, values)| self.metric.scalar(query, values).map(|d| (*id, d)))
                .collect()
        } else {
            self.entries
                .iter()
                .map(|(id, values)| self.metric.scalar(query, values).map(|d| (*id, d)))
                .collect()
        }
    }

    fn order_for_k(&self, mut scored: Vec<(VectorId, f32)>, k: usize) -> Vec<ScoredId> {
        let higher_is_closer = self.metric.higher_is_closer();
        if higher_is_closer {
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        } else {
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        }
        scored.truncate(k);
        scored.into_iter().map(|(id, score)| ScoredId::new(id, score)).collect()
    }
}

impl SearchIndex for LinearIndex {
    fn build(&mut self, entries: &[IndexEntry]) -> Result<()> {
        self.entries = entries.to_vec();
        Ok(())
    }

    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let scored = self.scored(query)?;
        Ok(self.order_for_k(scored, k))
    }

    fn range(&self, query: &[f32], radius: f32) -> Result<Vec<ScoredId>> {
        let higher_is_closer = self.metric.higher_is_closer();
        let mut scored: Vec<(VectorId, f32)> = self
            .scored(query)?
            .into_iter()
            .filter(|(_, d)| if higher_is_closer { *d >= radius } else { *d <= radius })
            .collect();
        if higher_is_closer {
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        } else {
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        }
        Ok(scored.into_iter().map(|(id, score)| ScoredId::new(id, score)).collect())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        write_u32(writer, self.entries.len() as u32)?;
        for (id, _) in &self.entries {
            write_u128(writer, id.0)?;
        }
        Ok(())
    }

    fn load(&mut self, reader: &mut dyn Read, snapshot: &[IndexEntry]) -> Result<()> {
        let map = snapshot_map(snapshot);
        let count = read_u32(reader)? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let id = read_u128(reader)?;
            let values = super::resolve(&map, id)?;
            entries.push((VectorId::from_u128(id), values));
        }
        self.entries = entries;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<IndexEntry> {
        vec![
            (VectorId::from_u128(1), vec![0.0, 0.0]),
            (VectorId::from_u128(2), vec![1.0, 0.0]),
            (VectorId::from_u128(3), vec![5.0, 0.0]),
        ]
    }

    #[test]
    fn nearest_returns_closest_first() {
        let mut idx = LinearIndex::new(DistanceMetric::Euclidean);
        idx.build(&entries()).unwrap();
        let result = idx.nearest(&[0.1, 0.0], 2).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, VectorId::from_u128(1));
        assert_eq!(result[1].id, VectorId::from_u128(2));
    }

    #[test]
    fn range_filters_by_radius() {
        let mut idx = LinearIndex::new(DistanceMetric::Euclidean);
        idx.build(&entries()).unwrap();
        let result = idx.range(&[0.0, 0.0], 1.5).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn cosine_orders_by_similarity_descending() {
        let mut idx = LinearIndex::new(DistanceMetric::Cosine);
        idx.build(&[
            (VectorId::from_u128(1), vec![1.0, 0.0]),
            (VectorId::from_u128(2), vec![0.0, 1.0]),
        ])
        .unwrap();
        let result = idx.nearest(&[1.0, 0.0], 2).unwrap();
        assert_eq!(result[0].id, VectorId::from_u128(1));
    }

    #[test]
    fn empty_index_returns_empty() {
        let idx = LinearIndex::new(DistanceMetric::Euclidean);
        assert!(idx.nearest(&[0.0], 5).unwrap().is_empty());
        assert!(idx.is_empty());
    }

    #[test]
    fn save_load_round_trip() {
        let mut idx = LinearIndex::new(DistanceMetric::Euclidean);
        idx.build(&entries()).unwrap();
        let mut bytes = Vec::new();
        idx.save(&mut bytes).unwrap();

        let mut reloaded = LinearIndex::new(DistanceMetric::Euclidean);
        reloaded.load(&mut bytes.as_slice(), &entries()).unwrap();
        assert_eq!(reloaded.len(), idx.len());
        let result = reloaded.nearest(&[0.1, 0.0], 2).unwrap();
        assert_eq!(result[0].id, VectorId::from_u128(1));
    }
}
