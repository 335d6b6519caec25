use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use detview_core::{Example, RecordStore, RecordWriter, StoreOptions, StrategyKind};
use std::hint::black_box;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn write_file(path: &Path, records: usize) {
    let mut writer = RecordWriter::create(path).unwrap();
    for i in 0..records {
        let n = 20 + i % 80;
        let classes: Vec<i8> = (0..n).map(|j| ((i + j) % 4) as i8).collect();
        let scores: Vec<i8> = (0..n).map(|j| ((i * 13 + j * 7) % 101) as i8).collect();
        writer.append(&Example::from_detections(format!("frame_{i:06}.jpg"), &classes, &scores)).unwrap();
    }
    writer.finish().unwrap();
}

fn bench_full_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_load");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));

    let temp_dir = TempDir::new().unwrap();
    for records in [1_000usize, 10_000] {
        let path = temp_dir.path().join(format!("bench_{records}.bin"));
        write_file(&path, records);
        group.throughput(Throughput::Elements(records as u64));

        for kind in [StrategyKind::Vectorized, StrategyKind::Scalar] {
            let store = RecordStore::new(StoreOptions { strategy: kind, ..Default::default() }).unwrap();
            group.bench_with_input(
                BenchmarkId::new(format!("{kind:?}"), records),
                &records,
                |b, _| {
                    b.iter(|| {
                        store.open(&path).unwrap();
                        black_box(store.load().unwrap());
                    });
                },
            );
        }
    }

    group.finish();
}

fn bench_item_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("item_path");

    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bench.bin");
    write_file(&path, 10_000);
    let store = RecordStore::new(StoreOptions::default()).unwrap();
    store.open(&path).unwrap();
    store.load().unwrap();

    // Best and worst case relative to the sparse index
    for index in [1024u32, 2047] {
        group.bench_with_input(BenchmarkId::new("index", index), &index, |b, &index| {
            b.iter(|| black_box(store.item_path(black_box(index)).unwrap()));
        });
    }

    group.bench_function("next_poi", |b| {
        b.iter(|| black_box(store.next_poi(black_box(5000))));
    });

    group.finish();
}

criterion_group!(benches, bench_full_load, bench_item_path);
criterion_main!(benches);
