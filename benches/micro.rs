//! Micro-benchmarks for StrataDB core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- put       # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{
    BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use stratadb::{Db, Iter, Options, ReadOptions, WriteBatch, WriteOptions};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Default value payload for benchmarks (128 bytes).
const VALUE_128B: &[u8; 128] = &[0xAB; 128];

/// Format a zero-padded key.
fn make_key(i: u64) -> Vec<u8> {
    format!("key-{i:012}").into_bytes()
}

/// Open a fresh database with the smallest legal write buffer so
/// flushes happen during sustained-write benchmarks.
fn open_small_buffer(dir: &std::path::Path) -> Db {
    Db::open(
        dir,
        Options {
            create_if_missing: true,
            write_buffer_size: 64 << 10,
            ..Options::default()
        },
    )
    .expect("open")
}

/// Open a database with a large write buffer so all data stays in the
/// memtable (no background flushes).
fn open_memtable_only(dir: &std::path::Path) -> Db {
    Db::open(
        dir,
        Options {
            create_if_missing: true,
            write_buffer_size: 64 * 1024 * 1024,
            ..Options::default()
        },
    )
    .expect("open")
}

/// Pre-populate a database with `count` sequential keys and compact,
/// so lookups run against on-disk tables.
fn prepopulate(dir: &std::path::Path, count: u64, value: &[u8]) {
    let db = open_small_buffer(dir);
    let wo = WriteOptions::default();
    for i in 0..count {
        db.put(&wo, &make_key(i), value).unwrap();
    }
    db.compact_range(None, None).unwrap();
    db.close().unwrap();
}

// ================================================================================================
// Write benchmarks
// ================================================================================================

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Bytes(VALUE_128B.len() as u64));

    group.bench_function("sequential_128b", |b| {
        let dir = TempDir::new().unwrap();
        let db = open_memtable_only(dir.path());
        let wo = WriteOptions::default();
        let mut i = 0u64;
        b.iter(|| {
            db.put(&wo, &make_key(i), black_box(VALUE_128B)).unwrap();
            i += 1;
        });
    });

    group.bench_function("sequential_128b_with_flushes", |b| {
        let dir = TempDir::new().unwrap();
        let db = open_small_buffer(dir.path());
        let wo = WriteOptions::default();
        let mut i = 0u64;
        b.iter(|| {
            db.put(&wo, &make_key(i), black_box(VALUE_128B)).unwrap();
            i += 1;
        });
    });

    group.finish();
}

fn bench_batch_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch");
    let batch_size = 100u64;
    group.throughput(Throughput::Elements(batch_size));

    group.bench_function("write_100_entries", |b| {
        let dir = TempDir::new().unwrap();
        let db = open_memtable_only(dir.path());
        let wo = WriteOptions::default();
        let mut base = 0u64;
        b.iter_batched(
            || {
                let mut batch = WriteBatch::new();
                for i in 0..batch_size {
                    batch.put(&make_key(base + i), VALUE_128B);
                }
                base += batch_size;
                batch
            },
            |batch| db.write(&wo, batch).unwrap(),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

// ================================================================================================
// Read benchmarks
// ================================================================================================

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let count = 10_000u64;

    group.bench_function("hit_from_tables", |b| {
        let dir = TempDir::new().unwrap();
        prepopulate(dir.path(), count, VALUE_128B);
        let db = open_small_buffer(dir.path());
        let ro = ReadOptions::new();
        let mut i = 0u64;
        b.iter(|| {
            let key = make_key(i % count);
            let value = db.get(&ro, black_box(&key)).unwrap();
            assert!(value.is_some());
            i = i.wrapping_add(7919); // prime stride ≈ random access
        });
    });

    group.bench_function("hit_random", |b| {
        use rand::Rng;
        let dir = TempDir::new().unwrap();
        prepopulate(dir.path(), count, VALUE_128B);
        let db = open_small_buffer(dir.path());
        let ro = ReadOptions::new();
        let mut rng = rand::rng();
        b.iter(|| {
            let key = make_key(rng.random_range(0..count));
            let value = db.get(&ro, black_box(&key)).unwrap();
            assert!(value.is_some());
        });
    });

    group.bench_function("miss", |b| {
        let dir = TempDir::new().unwrap();
        prepopulate(dir.path(), count, VALUE_128B);
        let db = open_small_buffer(dir.path());
        let ro = ReadOptions::new();
        b.iter(|| {
            assert!(db.get(&ro, black_box(b"absent-key")).unwrap().is_none());
        });
    });

    group.finish();
}

fn bench_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan");
    let count = 10_000u64;
    group.throughput(Throughput::Elements(count));

    group.bench_function("full_forward", |b| {
        let dir = TempDir::new().unwrap();
        prepopulate(dir.path(), count, VALUE_128B);
        let db = open_small_buffer(dir.path());
        let ro = ReadOptions::new();
        b.iter(|| {
            let mut it = db.new_iterator(&ro);
            it.seek_to_first();
            let mut n = 0u64;
            while it.valid() {
                black_box(it.key());
                it.next();
                n += 1;
            }
            assert_eq!(n, count);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_put, bench_batch_write, bench_get, bench_scan);
criterion_main!(benches);
