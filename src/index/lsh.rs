//! Locality-sensitive hashing index (spec §4.4.4): multiple tables of
//! random-hyperplane sign functions, queried by hashing into each table and
//! reranking the union of hash-bucket members exactly.

use super::codec::{read_f32, read_u128, read_u32, read_u64, write_f32, write_u128, write_u32, write_u64};
use super::{snapshot_map, IndexEntry, SearchIndex};
use crate::distance::DistanceMetric;
use crate::error::Result;
use crate::point::{ScoredId, VectorId};
use crate::rng::Xorshift64;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;
use std::io::{Read, Write};

struct HashTable {
    hyperplanes: Vec<Vec<f32>>,
    buckets: FxHashMap<u64, Vec<usize>>,
}

impl HashTable {
    fn hash(&self, values: &[f32]) -> u64 {
        let mut code = 0u64;
        for (bit, plane) in self.hyperplanes.iter().enumerate() {
            let dot: f32 = plane.iter().zip(values.iter()).map(|(a, b)| a * b).sum();
            if dot >= 0.0 {
                code |= 1 << bit;
            }
        }
        code
    }
}

/// A multi-table random-hyperplane LSH index.
pub struct LshIndex {
    metric: DistanceMetric,
    tables: Vec<HashTable>,
    entries: Vec<IndexEntry>,
    num_tables: usize,
    bits_per_table: usize,
    seed: u64,
}

impl LshIndex {
    #[must_use]
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            metric,
            tables: Vec::new(),
            entries: Vec::new(),
            num_tables: 4,
            bits_per_table: 12,
            seed: 0xC2B2_AE3D_27D4_EB4F,
        }
    }

    #[must_use]
    pub fn with_tables(mut self, num_tables: usize, bits_per_table: usize) -> Self {
        self.num_tables = num_tables.max(1);
        self.bits_per_table = bits_per_table.max(1);
        self
    }

    fn candidates(&self, query: &[f32]) -> Vec<usize> {
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        for table in &self.tables {
            let code = table.hash(query);
            if let Some(members) = table.buckets.get(&code) {
                for &idx in members {
                    if seen.insert(idx) {
                        out.push(idx);
                    }
                }
            }
        }
        out
    }
}

impl SearchIndex for LshIndex {
    fn build(&mut self, entries: &[IndexEntry]) -> Result<()> {
        self.entries = entries.to_vec();
        let dimension = entries.first().map_or(0, |(_, v)| v.len());
        let mut rng = Xorshift64::new(self.seed);

        self.tables = (0..self.num_tables)
            .map(|_| {
                let hyperplanes: Vec<Vec<f32>> = (0..self.bits_per_table)
                    .map(|_| {
                        let mut plane = vec![0.0f32; dimension];
                        rng.fill_signed_unit(&mut plane);
                        plane
                    })
                    .collect();
                let mut table = HashTable { hyperplanes, buckets: FxHashMap::default() };
                for (idx, (_, values)) in entries.iter().enumerate() {
                    let code = table.hash(values);
                    table.buckets.entry(code).or_default().push(idx);
                }
                table
            })
            .collect();
        Ok(())
    }

    fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let candidate_indices = self.candidates(query);
        let mut scored = Vec::with_capacity(candidate_indices.len());
        for idx in candidate_indices {
            let (id, values) = &self.entries[idx];
            scored.push((*id, self.metric.scalar(query, values)?));
        }
        let higher_is_closer = self.metric.higher_is_closer();
        if higher_is_closer {
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        } else {
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        }
        scored.truncate(k);
        Ok(scored.into_iter().map(|(id, score)| ScoredId::new(id, score)).collect())
    }

    fn range(&self, query: &[f32], radius: f32) -> Result<Vec<ScoredId>> {
        let candidate_indices = self.candidates(query);
        let higher_is_closer = self.metric.higher_is_closer();
        let mut scored = Vec::new();
        for idx in candidate_indices {
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

    /// Header (`num_tables`, `bits_per_table`, `seed`, `dimension`), the
    /// entry id list (positions correspond to the bucket member indices
    /// below), then per table: raw hyperplanes and bucket contents.
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        let dimension = self.entries.first().map_or(0, |(_, v)| v.len());
        write_u32(writer, self.num_tables as u32)?;
        write_u32(writer, self.bits_per_table as u32)?;
        write_u64(writer, self.seed)?;
        write_u32(writer, dimension as u32)?;

        write_u32(writer, self.entries.len() as u32)?;
        for (id, _) in &self.entries {
            write_u128(writer, id.0)?;
        }

        for table in &self.tables {
            for plane in &table.hyperplanes {
                for &component in plane {
                    write_f32(writer, component)?;
                }
            }
            write_u32(writer, table.buckets.len() as u32)?;
            for (&code, members) in &table.buckets {
                write_u64(writer, code)?;
                write_u32(writer, members.len() as u32)?;
                for &idx in members {
                    write_u32(writer, idx as u32)?;
                }
            }
        }
        Ok(())
    }

    fn load(&mut self, reader: &mut dyn Read, snapshot: &[IndexEntry]) -> Result<()> {
        let map = snapshot_map(snapshot);
        self.num_tables = read_u32(reader)? as usize;
        self.bits_per_table = read_u32(reader)? as usize;
        self.seed = read_u64(reader)?;
        let dimension = read_u32(reader)? as usize;

        let entry_count = read_u32(reader)? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let id = read_u128(reader)?;
            let values = super::resolve(&map, id)?;
            entries.push((VectorId::from_u128(id), values));
        }

        let mut tables = Vec::with_capacity(self.num_tables);
        for _ in 0..self.num_tables {
            let mut hyperplanes = Vec::with_capacity(self.bits_per_table);
            for _ in 0..self.bits_per_table {
                let mut plane = Vec::with_capacity(dimension);
                for _ in 0..dimension {
                    plane.push(read_f32(reader)?);
                }
                hyperplanes.push(plane);
            }
            let bucket_count = read_u32(reader)? as usize;
            let mut buckets = FxHashMap::default();
            for _ in 0..bucket_count {
                let code = read_u64(reader)?;
                let member_count = read_u32(reader)? as usize;
                let mut members = Vec::with_capacity(member_count);
                for _ in 0..member_count {
                    members.push(read_u32(reader)? as usize);
                }
                buckets.insert(code, members);
            }
            tables.push(HashTable { hyperplanes, buckets });
        }

        self.entries = entries;
        self.tables = tables;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<IndexEntry> {
        (0..200)
            .map(|i| {
                let f = i as f32;
                (VectorId::from_u128(i as u128), vec![f, f * 0.5, -f * 0.25, f.sqrt()])
            })
            .collect()
    }

    #[test]
    fn nearest_finds_the_exact_point_among_candidates() {
        let mut idx = LshIndex::new(DistanceMetric::Euclidean).with_tables(6, 10);
        idx.build(&entries()).unwrap();
        let (_, query) = entries()[50].clone();
        let result = idx.nearest(&query, 5).unwrap();
        assert!(result.iter().any(|r| r.id == VectorId::from_u128(50)));
    }

    #[test]
    fn more_tables_improves_recall_sanity() {
        let mut idx = LshIndex::new(DistanceMetric::Euclidean).with_tables(8, 8);
        idx.build(&entries()).unwrap();
        let mut hits = 0;
        for i in (0..200).step_by(20) {
            let (_, query) = entries()[i].clone();
            let result = idx.nearest(&query, 3).unwrap();
            if result.iter().any(|r| r.id == VectorId::from_u128(i as u128)) {
                hits += 1;
            }
        }
        assert!(hits >= 5, "expected most self-queries to recall themselves, got {hits}/10");
    }

    #[test]
    fn empty_index() {
        let idx = LshIndex::new(DistanceMetric::Euclidean);
        assert!(idx.is_empty());
    }

    #[test]
    fn save_load_round_trip() {
        let mut idx = LshIndex::new(DistanceMetric::Euclidean).with_tables(4, 6);
        let data = entries();
        idx.build(&data).unwrap();
        let mut bytes = Vec::new();
        idx.save(&mut bytes).unwrap();

        let mut reloaded = LshIndex::new(DistanceMetric::Euclidean);
        reloaded.load(&mut bytes.as_slice(), &data).unwrap();
        assert_eq!(reloaded.len(), idx.len());
        let (_, query) = data[50].clone();
        let result = reloaded.nearest(&query, 5).unwrap();
        assert!(result.iter().any(|r| r.id == VectorId::from_u128(50)));
    }
}
