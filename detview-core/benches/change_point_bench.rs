//! Change-point detection benchmarks over per-class count sequences.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use detview_core::ChangePointDetector;
use detview_core::derivative::change_points_scalar;
use std::hint::black_box;

/// Flat runs of `run` records, like counts over a video sequence
fn step_sequence(len: usize, run: usize) -> Vec<i8> {
    (0..len).map(|i| ((i / run) % 4) as i8).collect()
}

fn bench_change_points(c: &mut Criterion) {
    let mut group = c.benchmark_group("change_points");
    group.sample_size(100);

    for len in [1_000usize, 10_000, 100_000, 1_000_000] {
        group.throughput(Throughput::Elements(len as u64));
        let seq = step_sequence(len, 50);
        let mut detector = ChangePointDetector::new();

        group.bench_with_input(BenchmarkId::new("simd", len), &len, |bench, _| {
            bench.iter(|| black_box(detector.change_points(black_box(&seq)).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("scalar", len), &len, |bench, _| {
            bench.iter(|| black_box(change_points_scalar(black_box(&seq))));
        });
    }

    group.finish();
}

fn bench_change_density(c: &mut Criterion) {
    let mut group = c.benchmark_group("change_density");
    let len = 100_000;
    group.throughput(Throughput::Elements(len as u64));

    for run in [1usize, 10, 1000] {
        let seq = step_sequence(len, run);
        let mut detector = ChangePointDetector::new();
        group.bench_with_input(BenchmarkId::new("run", run), &run, |bench, _| {
            bench.iter(|| black_box(detector.change_points(black_box(&seq)).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_change_points, bench_change_density);
criterion_main!(benches);
