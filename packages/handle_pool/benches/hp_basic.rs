//! Basic benchmarks for the `handle_pool` package.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use handle_pool::{ByteReader, ByteWriter, NamedPool, Pool, Registry, SaveMode, StrongHandle};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

type TestItem = u64;
const TEST_VALUE: TestItem = 1024;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("hp_churn");

    group.bench_function("acquire_release_raw", |b| {
        let registry = Registry::new();
        let pool = Pool::<TestItem>::new(&registry);

        b.iter(|| {
            let handle = pool.acquire_raw(black_box(TEST_VALUE));
            pool.release(black_box(handle))
        });
    });

    group.bench_function("acquire_drop_handle", |b| {
        let registry = Registry::new();
        let pool = Pool::<TestItem>::new(&registry);

        b.iter(|| {
            drop(black_box(pool.acquire(TEST_VALUE)));
        });
    });

    group.bench_function("ten_thousand", |b| {
        let registry = Registry::new();
        let pool = Pool::<TestItem>::new(&registry);
        let mut handles: Vec<StrongHandle> = Vec::with_capacity(10_000);

        b.iter(|| {
            for _ in 0..10_000 {
                handles.push(pool.acquire_raw(TEST_VALUE));
            }

            for handle in handles.drain(..) {
                pool.release(handle);
            }
        });
    });

    group.finish();

    let mut group = c.benchmark_group("hp_access");

    group.bench_function("weak_lock", |b| {
        let registry = Registry::new();
        let pool = Pool::<TestItem>::new(&registry);
        let handle = pool.acquire(TEST_VALUE);
        let weak = handle.weak();

        b.iter(|| {
            let locked = pool.lock_raw(black_box(weak));
            pool.release(locked);
        });
    });

    group.bench_function("registry_increment_release", |b| {
        let registry = Registry::new();
        let pool = Pool::<TestItem>::new(&registry);
        let handle = pool.acquire(TEST_VALUE);

        b.iter(|| {
            registry.increment(black_box(handle.raw()));
            registry.release(black_box(handle.raw()));
        });
    });

    group.bench_function("named_lookup_hit", |b| {
        let registry = Registry::new();
        let pool = NamedPool::<u32, TestItem>::new(&registry);
        let held: Vec<_> = (0..1_000).map(|key| pool.acquire(key, TEST_VALUE).0).collect();

        b.iter(|| black_box(pool.raw_handle_of(&black_box(500))));

        drop(held);
    });

    group.finish();

    let mut group = c.benchmark_group("hp_persist");

    let registry = Registry::new();
    let source = Pool::<TestItem>::new(&registry);
    let target = Pool::<TestItem>::new(&registry);
    let held: Vec<_> = (0..1_000).map(|i| source.acquire(i)).collect();

    group.bench_function("save_full", |b| {
        b.iter(|| {
            let mut writer = ByteWriter::new();
            source.save(&mut writer, SaveMode::Full);
            black_box(writer.into_bytes())
        });
    });

    let mut writer = ByteWriter::new();
    source.save(&mut writer, SaveMode::Merge);
    let merged = writer.into_bytes();

    group.bench_function("load_merge_unchanged", |b| {
        target.load(&mut ByteReader::new(&merged), SaveMode::Merge).unwrap();

        b.iter(|| {
            black_box(
                target
                    .load(&mut ByteReader::new(&merged), SaveMode::Merge)
                    .unwrap(),
            )
        });
    });

    group.finish();

    drop(held);
}
