//! Product quantization (spec §4.4.7): splits each vector into `S`
//! equal-width sub-vectors, trains a `K`-centroid codebook per sub-space
//! with a small seeded k-means, and encodes each vector as `S` codebook
//! indices. Queries are scored with an asymmetric distance table (`S` ×
//! `K`) built once per query, avoiding reconstruction of any stored vector.

use super::super::codec::{read_f32, read_u128, read_u32, read_u64, read_u8, write_f32, write_u128, write_u32, write_u64, write_u8};
use super::super::snapshot_map;
use super::{IndexEntry, SearchIndex};
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::point::{ScoredId, VectorId};
use crate::rng::Xorshift64;
use std::cmp::Ordering;
use std::io::{Read, Write};

const KMEANS_ITERATIONS: usize = 15;

/// A trained codebook for one sub-space: `K` centroids of `sub_dim` floats.
#[derive(Clone)]
struct Codebook {
    centroids: Vec<Vec<f32>>,
}

impl Codebook {
    fn train(sub_vectors: &[&[f32]], k: usize, sub_dim: usize, rng: &mut Xorshift64) -> Self {
        let k = k.min(sub_vectors.len()).max(1);
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
        let mut chosen = std::collections::HashSet::new();
        while centroids.len() < k {
            let idx = rng.next_below(sub_vectors.len());
            if chosen.insert(idx) {
                centroids.push(sub_vectors[idx].to_vec());
            }
        }

        let mut assignment = vec![0usize; sub_vectors.len()];
        for _ in 0..KMEANS_ITERATIONS {
            for (i, sv) in sub_vectors.iter().enumerate() {
                let mut best = 0usize;
                let mut best_dist = f32::INFINITY;
                for (c, centroid) in centroids.iter().enumerate() {
                    let d = squared_euclidean(sv, centroid);
                    if d < best_dist {
                        best_dist = d;
                        best = c;
                    }
                }
                assignment[i] = best;
            }

            let mut sums = vec![vec![0.0f32; sub_dim]; k];
            let mut counts = vec![0usize; k];
            for (sv, &cluster) in sub_vectors.iter().zip(assignment.iter()) {
                counts[cluster] += 1;
                for (s, x) in sums[cluster].iter_mut().zip(sv.iter()) {
                    *s += x;
                }
            }
            for (c, centroid) in centroids.iter_mut().enumerate() {
                if counts[c] > 0 {
                    for (s, sum) in centroid.iter_mut().zip(sums[c].iter()) {
                        *s = sum / counts[c] as f32;
                    }
                }
            }
        }

        Self { centroids }
    }

    fn nearest_centroid(&self, sub_vector: &[f32]) -> u8 {
        let mut best = 0usize;
        let mut best_dist = f32::INFINITY;
        for (c, centroid) in self.centroids.iter().enumerate() {
            let d = squared_euclidean(sub_vector, centroid);
            if d < best_dist {
                best_dist = d;
                best = c;
            }
        }
        best as u8
    }

    fn distance_row(&self, query_sub: &[f32]) -> Vec<f32> {
        self.centroids.iter().map(|c| squared_euclidean(query_sub, c)).collect()
    }
}

fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

/// A product-quantized index: `num_subspaces` codebooks, each with
/// `centroids_per_subspace` centroids.
pub struct ProductQuantizationIndex {
    metric: DistanceMetric,
    num_subspaces: usize,
    centroids_per_subspace: usize,
    dimension: usize,
    sub_dim: usize,
    codebooks: Vec<Codebook>,
    codes: Vec<Vec<u8>>,
    entries: Vec<IndexEntry>,
    seed: u64,
    rerank_multiplier: usize,
}

impl ProductQuantizationIndex {
    #[must_use]
    pub fn new(metric: DistanceMetric, num_subspaces: usize, centroids_per_subspace: usize) -> Self {
        Self {
            metric,
            num_subspaces: num_subspaces.max(1),
            centroids_per_subspace: centroids_per_subspace.max(1),
            dimension: 0,
            sub_dim: 0,
            codebooks: Vec::new(),
            codes: Vec::new(),
            entries: Vec::new(),
            seed: 0x2545_F491_4F6C_DD1D,
            rerank_multiplier: 10,
        }
    }

    /// Ratio of original float storage to packed-code storage, e.g. `16.0`
    /// means the codes take 1/16th the space of the raw f32 vectors.
    #[must_use]
    pub fn compression_ratio(&self) -> f64 {
        if self.num_subspaces == 0 {
            return 1.0;
        }
        let raw_bytes = self.dimension * std::mem::size_of::<f32>();
        let code_bytes = self.num_subspaces;
        raw_bytes as f64 / code_bytes as f64
    }

    fn sub_slice<'a>(&self, values: &'a [f32], subspace: usize) -> &'a [f32] {
        let start = subspace * self.sub_dim;
        &values[start..start + self.sub_dim]
    }

    fn encode(&self, values: &[f32]) -> Vec<u8> {
        (0..self.num_subspaces)
            .map(|s| self.codebooks[s].nearest_centroid(self.sub_slice(values, s)))
            .collect()
    }

    fn asymmetric_distance_table(&self, query: &[f32]) -> Vec<Vec<f32>> {
        (0..self.num_subspaces).map(|s| self.codebooks[s].distance_row(self.sub_slice(query, s))).collect()
    }

    fn approx_distance(&self, table: &[Vec<f32>], code: &[u8]) -> f32 {
        code.iter().enumerate().map(|(s, &c)| table[s][c as usize]).sum::<f32>().sqrt()
    }

    fn shortlist(&self, query: &[f32], k: usize) -> Vec<usize> {
        let table = self.asymmetric_distance_table(query);
        let want = (k * self.rerank_multiplier).max(k).min(self.entries.len());
        let mut scored: Vec<(usize, f32)> =
            self.codes.iter().enumerate().map(|(i, code)| (i, self.approx_distance(&table, code))).collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        scored.truncate(want);
        scored.into_iter().map(|(i, _)| i).collect()
    }
}

impl SearchIndex for ProductQuantizationIndex {
    fn build(&mut self, entries: &[IndexEntry]) -> Result<()> {
        self.entries = entries.to_vec();
        self.dimension = entries.first().map_or(0, |(_, v)| v.len());
        if self.dimension == 0 {
            self.codes = Vec::new();
            return Ok(());
        }
        if self.dimension % self.num_subspaces != 0 {
            return Err(Error::InvalidConfiguration(format!(
                "dimension {} is not divisible by num_subspaces {}",
                self.dimension, self.num_subspaces
            )));
        }
        self.sub_dim = self.dimension / self.num_subspaces;

        let mut rng = Xorshift64::new(self.seed);
        let all_values: Vec<&[f32]> = entries.iter().map(|(_, v)| v.as_slice()).collect();
        self.codebooks = (0..self.num_subspaces)
            .map(|s| {
                let sub_vectors: Vec<&[f32]> = all_values.iter().map(|v| self.sub_slice(v, s)).collect();
                Codebook::train(&sub_vectors, self.centroids_per_subspace, self.sub_dim, &mut rng)
            })
            .collect();

        self.codes = entries.iter().map(|(_, v)| self.encode(v)).collect();
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

    /// Layout params, entry ids (values via snapshot), then codebooks and
    /// the per-entry subspace-index codes.
    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        write_u32(writer, self.num_subspaces as u32)?;
        write_u32(writer, self.centroids_per_subspace as u32)?;
        write_u32(writer, self.dimension as u32)?;
        write_u32(writer, self.sub_dim as u32)?;
        write_u64(writer, self.seed)?;
        write_u32(writer, self.rerank_multiplier as u32)?;

        write_u32(writer, self.entries.len() as u32)?;
        for (id, _) in &self.entries {
            write_u128(writer, id.0)?;
        }

        write_u32(writer, self.codebooks.len() as u32)?;
        for codebook in &self.codebooks {
            write_u32(writer, codebook.centroids.len() as u32)?;
            for centroid in &codebook.centroids {
                for &component in centroid {
                    write_f32(writer, component)?;
                }
            }
        }

        write_u32(writer, self.codes.len() as u32)?;
        for code in &self.codes {
            for &byte in code {
                write_u8(writer, byte)?;
            }
        }
        Ok(())
    }

    fn load(&mut self, reader: &mut dyn Read, snapshot: &[IndexEntry]) -> Result<()> {
        let map = snapshot_map(snapshot);

        self.num_subspaces = read_u32(reader)? as usize;
        self.centroids_per_subspace = read_u32(reader)? as usize;
        self.dimension = read_u32(reader)? as usize;
        self.sub_dim = read_u32(reader)? as usize;
        self.seed = read_u64(reader)?;
        self.rerank_multiplier = read_u32(reader)? as usize;

        let entry_count = read_u32(reader)? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let id = read_u128(reader)?;
            let values = super::super::resolve(&map, id)?;
            entries.push((VectorId::from_u128(id), values));
        }

        let codebook_count = read_u32(reader)? as usize;
        let mut codebooks = Vec::with_capacity(codebook_count);
        for _ in 0..codebook_count {
            let centroid_count = read_u32(reader)? as usize;
            let mut centroids = Vec::with_capacity(centroid_count);
            for _ in 0..centroid_count {
                let mut centroid = Vec::with_capacity(self.sub_dim);
                for _ in 0..self.sub_dim {
                    centroid.push(read_f32(reader)?);
                }
                centroids.push(centroid);
            }
            codebooks.push(Codebook { centroids });
        }

        let code_count = read_u32(reader)? as usize;
        let mut codes = Vec::with_capacity(code_count);
        for _ in 0..code_count {
            let mut code = Vec::with_capacity(self.num_subspaces);
            for _ in 0..self.num_subspaces {
                code.push(read_u8(reader)?);
            }
            codes.push(code);
        }

        self.entries = entries;
        self.codebooks = codebooks;
        self.codes = codes;
        Ok(())
    }
}
