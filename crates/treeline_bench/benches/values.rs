//! Value round-trip benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use treeline_bench::{memory_client, random_value};
use treeline_client::{Key, NativeBuffer, TxnOutcome};

/// Benchmark node set followed by get.
fn bench_node_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_round_trip");

    for size in [16, 256, 4096, 65536].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let client = memory_client();
            let conn = client.conn();
            let node = conn.node("^bench", &["value"]).unwrap();
            let value = random_value(size);

            b.iter(|| {
                node.set(black_box(&value)).unwrap();
                black_box(node.get().unwrap());
            });
        });
    }
    group.finish();
}

/// Benchmark key get into an undersized buffer, which grows once per call.
fn bench_key_get_retry(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_get");

    for size in [256, 4096].iter() {
        group.bench_with_input(BenchmarkId::new("fits", size), size, |b, &size| {
            let client = memory_client();
            let conn = client.conn();
            let key = Key::from_parts("^bench", &["key"]).unwrap();
            key.set(&conn, &NativeBuffer::from_value(&random_value(size)).unwrap()).unwrap();
            let mut ret = NativeBuffer::with_capacity(size as u32).unwrap();

            b.iter(|| key.get(&conn, black_box(&mut ret)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("grows", size), size, |b, &size| {
            let client = memory_client();
            let conn = client.conn();
            let key = Key::from_parts("^bench", &["key"]).unwrap();
            key.set(&conn, &NativeBuffer::from_value(&random_value(size)).unwrap()).unwrap();

            b.iter(|| {
                let mut ret = NativeBuffer::with_capacity(1).unwrap();
                key.get(&conn, &mut ret).unwrap();
                black_box(ret);
            });
        });
    }
    group.finish();
}

/// Benchmark increments.
fn bench_incr(c: &mut Criterion) {
    let client = memory_client();
    let conn = client.conn();
    let counter = conn.var("^counter").unwrap();

    c.bench_function("incr", |b| {
        b.iter(|| black_box(counter.incr("1").unwrap()));
    });
}

/// Benchmark the cost of running a closure through the transaction bridge.
fn bench_transaction_overhead(c: &mut Criterion) {
    let client = memory_client();
    let conn = client.conn();

    c.bench_function("transaction_empty", |b| {
        b.iter(|| {
            conn.transaction("bench", &[], |_| Ok(TxnOutcome::Commit)).unwrap();
        });
    });

    c.bench_function("transaction_one_set", |b| {
        b.iter(|| {
            conn.transaction("bench", &[], |txn| {
                txn.var("^tx")?.set("1")?;
                Ok(TxnOutcome::Commit)
            })
            .unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_node_round_trip,
    bench_key_get_retry,
    bench_incr,
    bench_transaction_overhead,
);

criterion_main!(benches);
