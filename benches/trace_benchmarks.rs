//! Trace collector benchmarks
//!
//! Benchmarks for span ingestion and tree rendering:
//! - Ingesting batches shipped back from workers
//! - Rendering a batch as a console tree
//!
//! Toyota Way: Measure before optimizing (Genchi Genbutsu)

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowrun::trace::{Span, SpanTree, TraceCollector, TreeConsoleExporter};

/// One experiment root with `nodes` node spans of `lines` line spans each
fn create_batch(nodes: usize, lines: usize) -> Vec<Span> {
    let root = Span::builder("experiment bench").root_run_id("bench").build();
    let mut batch = vec![root.clone()];
    for node in 0..nodes {
        let node_span = Span::builder(format!("node {node}"))
            .parent(&root.context())
            .root_run_id("bench")
            .build();
        for line in 0..lines {
            batch.push(
                Span::builder(format!("line {line}"))
                    .parent(&node_span.context())
                    .root_run_id("bench")
                    .build(),
            );
        }
        batch.push(node_span);
    }
    batch
}

/// Benchmark ingesting worker batches into the in-memory store
fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("span_ingest");

    for lines in [10, 100, 1_000].iter() {
        let batch = create_batch(1, *lines);
        group.bench_with_input(BenchmarkId::from_parameter(lines), lines, |b, _| {
            let collector = TraceCollector::new();
            b.iter(|| {
                collector.add_spans(batch.clone());
                black_box(collector.pop_spans_from_run_id("bench"));
            });
        });
    }

    group.finish();
}

/// Benchmark tree rendering
fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("span_tree_render");

    for nodes in [1, 10, 50].iter() {
        let batch = create_batch(*nodes, 20);
        group.bench_with_input(BenchmarkId::from_parameter(nodes), nodes, |b, _| {
            b.iter(|| black_box(TreeConsoleExporter::render(&batch)));
        });
    }

    group.finish();

    let batch = create_batch(10, 20);
    c.bench_function("span_tree_index_210", |b| {
        b.iter(|| black_box(SpanTree::from_batch(&batch).roots().len()));
    });
}

criterion_group!(benches, bench_ingest, bench_render);
criterion_main!(benches);
