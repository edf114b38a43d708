//! Benchmark the scalar, SIMD, and batch distance kernels across realistic
//! embedding dimensions.
//!
//! Run with: `cargo bench --bench distance_benchmark`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use veloxdb_core::DistanceMetric;

fn generate_vector(dim: usize, seed: f32) -> Vec<f32> {
    (0..dim).map(|i| (seed + i as f32 * 0.1).sin()).collect()
}

fn warmup<F: Fn()>(f: F) {
    for _ in 0..3 {
        f();
    }
}

fn bench_scalar_vs_simd(c: &mut Criterion) {
    let mut group = c.benchmark_group("euclidean_scalar_vs_simd");

    for dim in &[128, 384, 768, 1536, 3072] {
        let a = generate_vector(*dim, 0.0);
        let b = generate_vector(*dim, 1.0);

        group.bench_with_input(BenchmarkId::new("scalar", dim), dim, |bencher, _| {
            warmup(|| {
                let _ = DistanceMetric::Euclidean.scalar(&a, &b);
            });
            bencher.iter(|| DistanceMetric::Euclidean.scalar(black_box(&a), black_box(&b)));
        });

        group.bench_with_input(BenchmarkId::new("simd", dim), dim, |bencher, _| {
            warmup(|| {
                let _ = DistanceMetric::Euclidean.simd(&a, &b);
            });
            bencher.iter(|| DistanceMetric::Euclidean.simd(black_box(&a), black_box(&b)));
        });
    }

    group.finish();
}

fn bench_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics_at_768d");
    let a = generate_vector(768, 0.0);
    let b = generate_vector(768, 1.0);

    for metric in [
        DistanceMetric::Euclidean,
        DistanceMetric::Manhattan,
        DistanceMetric::Chebyshev,
        DistanceMetric::Minkowski3,
        DistanceMetric::Cosine,
    ] {
        group.bench_with_input(BenchmarkId::new("simd", format!("{metric:?}")), &metric, |bencher, m| {
            bencher.iter(|| m.simd(black_box(&a), black_box(&b)));
        });
    }

    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_768d");
    let query = generate_vector(768, 0.0);
    let candidates: Vec<Vec<f32>> = (0..1000).map(|i| generate_vector(768, i as f32)).collect();
    let refs: Vec<&[f32]> = candidates.iter().map(std::vec::Vec::as_slice).collect();

    group.bench_function("euclidean_1000_candidates", |bencher| {
        bencher.iter(|| DistanceMetric::Euclidean.batch(black_box(&query), black_box(&refs)));
    });

    group.finish();
}

criterion_group!(benches, bench_scalar_vs_simd, bench_metrics, bench_batch);
criterion_main!(benches);
