//! Child and subtree iteration benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use treeline_bench::{memory_client, populate_children};

/// Benchmark walking children with one reusable cursor.
fn bench_mutable_cursor(c: &mut Criterion) {
    let mut group = c.benchmark_group("children_cursor");

    for count in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let client = memory_client();
            let conn = client.conn();
            populate_children(&conn, "^bench", count);
            let root = conn.var("^bench").unwrap();

            b.iter(|| {
                let mut children = root.children().unwrap();
                let mut seen = 0;
                while let Some(child) = children.advance().unwrap() {
                    black_box(child);
                    seen += 1;
                }
                assert_eq!(seen, count);
            });
        });
    }
    group.finish();
}

/// Benchmark walking children with a fresh node per step.
fn bench_fresh_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("children_fresh");

    for count in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let client = memory_client();
            let conn = client.conn();
            populate_children(&conn, "^bench", count);
            let start = conn.node("^bench", &[""]).unwrap();

            b.iter(|| {
                let mut seen = 0;
                let mut cursor = start.next_sibling().unwrap();
                while let Some(node) = cursor {
                    cursor = node.next_sibling().unwrap();
                    black_box(node);
                    seen += 1;
                }
                assert_eq!(seen, count);
            });
        });
    }
    group.finish();
}

/// Benchmark depth-first subtree iteration.
fn bench_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree");

    for fanout in [4, 8, 16].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(fanout), fanout, |b, &fanout| {
            let client = memory_client();
            let conn = client.conn();
            for i in 0..fanout {
                for j in 0..fanout {
                    conn.node("^deep", &[i.to_string(), j.to_string()]).unwrap().set("v").unwrap();
                }
            }
            let root = conn.var("^deep").unwrap();

            b.iter(|| {
                let count = root.tree().map(|node| node.unwrap()).count();
                black_box(count);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_mutable_cursor, bench_fresh_nodes, bench_tree);

criterion_main!(benches);
