// Metric sink throughput benchmarks
//
// Key metrics measured:
// - Single-writer record latency per metric kind
// - Contended writes from many concurrent clients
// - Snapshot and threshold evaluation over a large duration metric
//
// Usage:
//   cargo bench --bench metric_sink

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use loadgate::metrics::{MetricKind, MetricSink};
use loadgate::threshold::ThresholdGate;
use std::collections::BTreeMap;
use std::hint::black_box;
use std::time::Duration;

fn bench_record(c: &mut Criterion) {
    let sink = MetricSink::new();
    sink.register("rpc_call_duration", MetricKind::Duration).unwrap();
    sink.register("cross_node_messages", MetricKind::Counter).unwrap();
    sink.register("request_errors", MetricKind::Rate).unwrap();
    sink.register("concurrent_websockets", MetricKind::Gauge).unwrap();

    c.bench_function("sink_add_duration", |b| {
        b.iter(|| sink.add_duration("rpc_call_duration", black_box(Duration::from_micros(850))))
    });
    c.bench_function("sink_add_count", |b| {
        b.iter(|| sink.add_count("cross_node_messages", black_box(1)))
    });
    c.bench_function("sink_add_rate", |b| {
        b.iter(|| sink.add_rate("request_errors", black_box(false)))
    });
    c.bench_function("sink_adjust_gauge", |b| {
        b.iter(|| sink.adjust_gauge("concurrent_websockets", black_box(1.0)))
    });
}

fn bench_contended(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .build()
        .expect("Failed to create Tokio runtime for benchmark");

    let mut group = c.benchmark_group("sink_contended_writes");
    for writers in [4u64, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(writers), &writers, |b, &writers| {
            b.iter(|| {
                let sink = MetricSink::new();
                rt.block_on(async {
                    let mut tasks = tokio::task::JoinSet::new();
                    for id in 0..writers {
                        let sink = sink.clone();
                        tasks.spawn(async move {
                            for i in 0..1_000u64 {
                                let _ = sink.add_trend("shard_lookup_duration", (id * i) as f64);
                                let _ = sink.add_count("iterations", 1);
                            }
                        });
                    }
                    while tasks.join_next().await.is_some() {}
                });
                black_box(sink.snapshot_all());
            });
        });
    }
    group.finish();
}

fn bench_snapshot_and_gate(c: &mut Criterion) {
    let sink = MetricSink::new();
    for i in 0..100_000u64 {
        sink.add_trend("http_req_duration", (i % 997) as f64).unwrap();
        sink.add_rate("http_req_failed", i % 100 == 0).unwrap();
    }

    let mut thresholds = BTreeMap::new();
    thresholds.insert(
        "http_req_duration".to_string(),
        vec!["p(95)<500".to_string(), "p(99)<1000".to_string()],
    );
    thresholds.insert("http_req_failed".to_string(), vec!["rate<0.05".to_string()]);
    let gate = ThresholdGate::from_map(&thresholds).unwrap();

    c.bench_function("sink_snapshot_100k", |b| b.iter(|| black_box(sink.snapshot_all())));

    let snapshot = sink.snapshot_all();
    c.bench_function("gate_evaluate", |b| b.iter(|| black_box(gate.evaluate(&snapshot))));
}

criterion_group!(benches, bench_record, bench_contended, bench_snapshot_and_gate);
criterion_main!(benches);
