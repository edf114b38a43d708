//! Distance kernels (spec §4.1): a pluggable family of metrics with scalar,
//! SIMD, and batch variants over equal-dimension float vectors.

mod simd;

pub use simd::simd_width_hint;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A supported distance/similarity metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// L2 / Euclidean distance.
    Euclidean,
    /// L1 / Manhattan distance.
    Manhattan,
    /// L∞ / Chebyshev distance.
    Chebyshev,
    /// Minkowski distance with p = 3.
    Minkowski3,
    /// Cosine similarity, in `[-1, 1]`.
    Cosine,
}

impl DistanceMetric {
    /// `true` for metrics where a larger value means "more similar" rather
    /// than "farther apart" (currently only [`DistanceMetric::Cosine`]).
    #[must_use]
    pub fn higher_is_closer(self) -> bool {
        matches!(self, Self::Cosine)
    }

    fn check_dims(a: &[f32], b: &[f32]) -> Result<()> {
        if a.is_empty() || b.is_empty() {
            return Err(Error::NullInput);
        }
        if a.len() != b.len() {
            return Err(Error::DimensionMismatch {
                expected: a.len(),
                actual: b.len(),
            });
        }
        Ok(())
    }

    /// Scalar reference implementation. Always correct; SIMD/batch variants
    /// must agree with this within the tolerance asserted in tests.
    pub fn scalar(self, a: &[f32], b: &[f32]) -> Result<f32> {
        Self::check_dims(a, b)?;
        Ok(match self {
            Self::Euclidean => scalar_euclidean(a, b),
            Self::Manhattan => scalar_manhattan(a, b),
            Self::Chebyshev => scalar_chebyshev(a, b),
            Self::Minkowski3 => scalar_minkowski3(a, b),
            Self::Cosine => scalar_cosine(a, b),
        })
    }

    /// SIMD-accelerated implementation with a portable scalar fallback.
    /// Falls back to the generic scalar path whenever the platform lacks
    /// the targeted instruction set or the dimension doesn't suit the
    /// specialized fast path.
    pub fn simd(self, a: &[f32], b: &[f32]) -> Result<f32> {
        Self::check_dims(a, b)?;
        Ok(simd::dispatch(self, a, b))
    }

    /// Computes distances from `query` to every vector in `candidates`, in
    /// input order, regardless of any internal chunked parallelism.
    pub fn batch(self, query: &[f32], candidates: &[&[f32]]) -> Result<Vec<f32>> {
        if query.is_empty() {
            return Err(Error::NullInput);
        }
        for c in candidates {
            Self::check_dims(query, c)?;
        }
        Ok(simd::batch_dispatch(self, query, candidates))
    }

    /// Suggested number of candidates to process per chunk for [`Self::batch`],
    /// chosen so a query plus one chunk of candidates fits a typical L2 cache
    /// (256 KiB), leaving headroom for the accumulator and loop state.
    #[must_use]
    pub fn optimal_batch_size(self, dimension: usize) -> usize {
        const TARGET_BYTES: usize = 192 * 1024;
        let per_vector = dimension * std::mem::size_of::<f32>();
        if per_vector == 0 {
            return 1;
        }
        (TARGET_BYTES / per_vector).max(1)
    }
}

fn scalar_euclidean(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum.sqrt()
}

fn scalar_manhattan(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        sum += (a[i] - b[i]).abs();
    }
    sum
}

fn scalar_chebyshev(a: &[f32], b: &[f32]) -> f32 {
    let mut max = 0.0f32;
    for i in 0..a.len() {
        let d = (a[i] - b[i]).abs();
        if d > max {
            max = d;
        }
    }
    max
}

fn scalar_minkowski3(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for i in 0..a.len() {
        let d = (a[i] - b[i]).abs();
        sum += d * d * d;
    }
    sum.cbrt()
}

fn scalar_cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

pub(crate) fn scalar_for(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Euclidean => scalar_euclidean(a, b),
        DistanceMetric::Manhattan => scalar_manhattan(a, b),
        DistanceMetric::Chebyshev => scalar_chebyshev(a, b),
        DistanceMetric::Minkowski3 => scalar_minkowski3(a, b),
        DistanceMetric::Cosine => scalar_cosine(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_identity_is_one() {
        let v = [1.0, 0.0, 0.0];
        assert!((DistanceMetric::Cosine.scalar(&v, &v).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert!(DistanceMetric::Cosine.scalar(&a, &b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn cosine_zero_magnitude_rule() {
        let a = [0.0, 0.0, 0.0];
        let b = [1.0, 1.0, 1.0];
        assert_eq!(DistanceMetric::Cosine.scalar(&a, &b).unwrap(), 0.0);
    }

    #[test]
    fn euclidean_known_value() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        assert!((DistanceMetric::Euclidean.scalar(&a, &b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn manhattan_known_value() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        assert!((DistanceMetric::Manhattan.scalar(&a, &b).unwrap() - 7.0).abs() < 1e-6);
    }

    #[test]
    fn chebyshev_known_value() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        assert!((DistanceMetric::Chebyshev.scalar(&a, &b).unwrap() - 4.0).abs() < 1e-6);
    }

    #[test]
    fn minkowski3_known_value() {
        let a = [0.0, 0.0];
        let b = [3.0, 4.0];
        let expected = (27.0f32 + 64.0).cbrt();
        assert!((DistanceMetric::Minkowski3.scalar(&a, &b).unwrap() - expected).abs() < 1e-4);
    }

    #[test]
    fn mismatched_dimension_errors() {
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0];
        assert!(matches!(
            DistanceMetric::Euclidean.scalar(&a, &b),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn empty_input_errors() {
        let a: [f32; 0] = [];
        let b: [f32; 0] = [];
        assert!(matches!(
            DistanceMetric::Euclidean.scalar(&a, &b),
            Err(Error::NullInput)
        ));
    }

    #[test]
    fn simd_agrees_with_scalar() {
        let a: Vec<f32> = (0..133).map(|i| (i as f32) * 0.37 - 10.0).collect();
        let b: Vec<f32> = (0..133).map(|i| (i as f32) * -0.12 + 3.0).collect();
        for metric in [
            DistanceMetric::Euclidean,
            DistanceMetric::Manhattan,
            DistanceMetric::Chebyshev,
            DistanceMetric::Minkowski3,
            DistanceMetric::Cosine,
        ] {
            let scalar = metric.scalar(&a, &b).unwrap();
            let simd = metric.simd(&a, &b).unwrap();
            let rel_err = ((scalar - simd) / scalar.abs().max(1e-6)).abs();
            assert!(rel_err < 1e-4, "{metric:?}: scalar={scalar} simd={simd}");
        }
    }

    #[test]
    fn batch_preserves_order() {
        let query = [1.0, 0.0];
        let c1 = [0.0, 1.0];
        let c2 = [1.0, 0.0];
        let c3 = [2.0, 0.0];
        let candidates: Vec<&[f32]> = vec![&c1, &c2, &c3];
        let distances = DistanceMetric::Euclidean.batch(&query, &candidates).unwrap();
        assert_eq!(distances.len(), 3);
        assert!((distances[1]).abs() < 1e-6);
        assert!((distances[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn batch_agrees_with_scalar_loop() {
        let query: Vec<f32> = (0..64).map(|i| i as f32 * 0.1).collect();
        let candidates: Vec<Vec<f32>> = (0..50)
            .map(|j| (0..64).map(|i| (i as f32 + j as f32) * 0.05).collect())
            .collect();
        let refs: Vec<&[f32]> = candidates.iter().map(std::vec::Vec::as_slice).collect();

        for metric in [DistanceMetric::Cosine, DistanceMetric::Euclidean] {
            let batch = metric.batch(&query, &refs).unwrap();
            for (i, cand) in refs.iter().enumerate() {
                let single = metric.scalar(&query, cand).unwrap();
                assert!((batch[i] - single).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn optimal_batch_size_is_positive() {
        assert!(DistanceMetric::Euclidean.optimal_batch_size(1536) >= 1);
        assert!(DistanceMetric::Euclidean.optimal_batch_size(0) >= 1);
    }
}
