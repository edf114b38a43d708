//! Dispatch layer for distance kernels.
//!
//! A cached capability probe picks a lane width once, then every kernel is
//! expressed as a chunked, auto-vectorization-friendly loop rather than
//! `unsafe` intrinsics, so the crate carries no `unsafe` blocks in its hot
//! path while still giving the optimizer fixed-width chunks to work with.

use super::{scalar_for, DistanceMetric};
use std::sync::OnceLock;

/// Coarse SIMD capability of the current CPU, used only to pick a lane width
/// for the chunked kernels below (not to select an intrinsic kernel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimdLevel {
    Wide,
    Narrow,
}

static SIMD_LEVEL: OnceLock<SimdLevel> = OnceLock::new();

fn detect_simd_level() -> SimdLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            return SimdLevel::Wide;
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        return SimdLevel::Wide;
    }
    #[allow(unreachable_code)]
    SimdLevel::Narrow
}

fn simd_level() -> SimdLevel {
    *SIMD_LEVEL.get_or_init(detect_simd_level)
}

/// Lane width used by the chunked kernels for the detected capability level.
/// Exposed so callers (e.g. batch sizing) can reason about alignment.
#[must_use]
pub fn simd_width_hint() -> usize {
    match simd_level() {
        SimdLevel::Wide => 8,
        SimdLevel::Narrow => 4,
    }
}

/// Dimensions with a specialized fast path; every other dimension takes the
/// generic chunked loop. 128 and 1536 are common embedding sizes (CLIP/ada
/// style) worth unrolling by hand.
const FAST_DIMS: [usize; 2] = [128, 1536];

pub(super) fn dispatch(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    if FAST_DIMS.contains(&a.len()) {
        return fast_path(metric, a, b);
    }
    chunked(metric, a, b)
}

fn fast_path(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    // The "fast path" for fixed known dimensions is the same chunked kernel
    // with a width chosen to divide the dimension evenly, avoiding a
    // ragged remainder loop.
    let width = if a.len() % 8 == 0 { 8 } else { 4 };
    chunked_with_width(metric, a, b, width)
}

fn chunked(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    chunked_with_width(metric, a, b, simd_width_hint())
}

fn chunked_with_width(metric: DistanceMetric, a: &[f32], b: &[f32], width: usize) -> f32 {
    match metric {
        DistanceMetric::Euclidean => chunked_euclidean(a, b, width),
        DistanceMetric::Manhattan => chunked_manhattan(a, b, width),
        DistanceMetric::Cosine => chunked_cosine(a, b, width),
        // Chebyshev/Minkowski3 gain little from lane-chunking (max-reduction,
        // cube root); the scalar loop is already what the auto-vectorizer
        // produces for them.
        DistanceMetric::Chebyshev | DistanceMetric::Minkowski3 => scalar_for(metric, a, b),
    }
}

fn chunked_euclidean(a: &[f32], b: &[f32], width: usize) -> f32 {
    let mut accs = vec![0.0f32; width];
    let chunks = a.len() / width;
    for c in 0..chunks {
        let base = c * width;
        for lane in 0..width {
            let d = a[base + lane] - b[base + lane];
            accs[lane] += d * d;
        }
    }
    let mut sum: f32 = accs.into_iter().sum();
    for i in (chunks * width)..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum.sqrt()
}

fn chunked_manhattan(a: &[f32], b: &[f32], width: usize) -> f32 {
    let mut accs = vec![0.0f32; width];
    let chunks = a.len() / width;
    for c in 0..chunks {
        let base = c * width;
        for lane in 0..width {
            accs[lane] += (a[base + lane] - b[base + lane]).abs();
        }
    }
    let mut sum: f32 = accs.into_iter().sum();
    for i in (chunks * width)..a.len() {
        sum += (a[i] - b[i]).abs();
    }
    sum
}

fn chunked_cosine(a: &[f32], b: &[f32], width: usize) -> f32 {
    let mut dot_acc = vec![0.0f32; width];
    let mut na_acc = vec![0.0f32; width];
    let mut nb_acc = vec![0.0f32; width];
    let chunks = a.len() / width;
    for c in 0..chunks {
        let base = c * width;
        for lane in 0..width {
            let x = a[base + lane];
            let y = b[base + lane];
            dot_acc[lane] += x * y;
            na_acc[lane] += x * x;
            nb_acc[lane] += y * y;
        }
    }
    let mut dot: f32 = dot_acc.into_iter().sum();
    let mut norm_a: f32 = na_acc.into_iter().sum();
    let mut norm_b: f32 = nb_acc.into_iter().sum();
    for i in (chunks * width)..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

pub(super) fn batch_dispatch(metric: DistanceMetric, query: &[f32], candidates: &[&[f32]]) -> Vec<f32> {
    candidates.iter().map(|c| dispatch(metric, query, c)).collect()
}
