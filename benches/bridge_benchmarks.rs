//! Criterion benchmarks for rust_storage_bridge

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_storage_bridge::core::aggregation::aggregate_records;
use rust_storage_bridge::core::crypto::Cipher;
use rust_storage_bridge::core::query::sort_records;
use rust_storage_bridge::core::value::compare_values;
use rust_storage_bridge::prelude::*;

fn people(size: usize) -> Vec<Record> {
    (0..size)
        .map(|i| {
            record([
                ("dept", FieldValue::from(format!("dept_{}", i % 7))),
                ("age", FieldValue::from((i * 37 % 90) as i64)),
            ])
        })
        .collect()
}

// ============================================================================
// Value Comparison Benchmarks
// ============================================================================

fn bench_value_comparisons(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_comparisons");
    group.throughput(Throughput::Elements(1));

    let int = FieldValue::from(42i32);
    let long = FieldValue::from(43i64);
    let double = FieldValue::from(std::f64::consts::PI);
    let text = FieldValue::from("hello");

    group.bench_function("int_long", |b| {
        b.iter(|| black_box(compare_values(black_box(&int), black_box(&long))))
    });

    group.bench_function("long_double", |b| {
        b.iter(|| black_box(compare_values(black_box(&long), black_box(&double))))
    });

    group.bench_function("mixed_family", |b| {
        b.iter(|| black_box(compare_values(black_box(&text), black_box(&int))))
    });

    group.finish();
}

// ============================================================================
// In-Memory Query Benchmarks
// ============================================================================

fn bench_sort_records(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_records");
    let order = [OrderBy::asc("dept"), OrderBy::desc("age")];

    for size in [100, 1_000, 10_000].iter() {
        let rows = people(*size);
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::from_parameter(size), &rows, |b, rows| {
            b.iter(|| {
                let mut rows = rows.clone();
                sort_records(&mut rows, &order);
                black_box(rows)
            });
        });
    }

    group.finish();
}

fn bench_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");
    let spec: AggregationSpec<()> = AggregationSpec::new()
        .group_by(["dept"])
        .aggregate("n", Aggregate::Count)
        .aggregate("avg_age", Aggregate::Avg("age".into()))
        .aggregate("max_age", Aggregate::Max("age".into()))
        .order_by(OrderBy::desc("n"));

    for size in [100, 1_000, 10_000].iter() {
        let rows = people(*size);
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("grouped", size), &rows, |b, rows| {
            b.iter(|| black_box(aggregate_records(rows.clone(), &spec)));
        });
    }

    group.finish();
}

// ============================================================================
// Encryption Benchmarks
// ============================================================================

fn bench_cipher(c: &mut Criterion) {
    let mut group = c.benchmark_group("cipher");
    let cipher = Cipher::new(&EncryptionKey::generate());

    for size in [64usize, 1_024, 16_384].iter() {
        let plaintext = vec![0xA5u8; *size];
        let sealed = cipher.seal(&plaintext, b"key").unwrap();
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("seal", size), &plaintext, |b, data| {
            b.iter(|| black_box(cipher.seal(data, b"key").unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("open", size), &sealed, |b, data| {
            b.iter(|| black_box(cipher.open(data, b"key").unwrap()));
        });
    }

    group.finish();
}

// ============================================================================
// Key-Value Store Benchmarks
// ============================================================================

#[cfg(feature = "embedded")]
fn bench_key_value_store(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let plain = KeyValueStore::temporary("bench");
    let sealed = KeyValueStore::encrypted(
        rust_storage_bridge::core::KeyValueConfig::temporary("bench-sealed"),
        &EncryptionKey::generate(),
    );
    runtime.block_on(async {
        plain.open().await.unwrap();
        sealed.open().await.unwrap();
    });

    let mut group = c.benchmark_group("key_value_store");
    group.throughput(Throughput::Elements(1));

    for (name, store) in [("plain", &plain), ("encrypted", &sealed)] {
        group.bench_function(BenchmarkId::new("write", name), |b| {
            b.iter(|| runtime.block_on(store.write("key", &black_box(42i64))).unwrap());
        });

        group.bench_function(BenchmarkId::new("read", name), |b| {
            b.iter(|| black_box(runtime.block_on(store.read("key", 0i64)).unwrap()));
        });
    }

    group.finish();
}

#[cfg(not(feature = "embedded"))]
fn bench_key_value_store(_c: &mut Criterion) {}

// ============================================================================
// Criterion Configuration
// ============================================================================

criterion_group!(
    benches,
    bench_value_comparisons,
    bench_sort_records,
    bench_aggregation,
    bench_cipher,
    bench_key_value_store
);

criterion_main!(benches);
