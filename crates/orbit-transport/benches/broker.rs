//! Benchmarks for the in-process broker publish/consume path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use orbit_transport::{Broker, MemoryBroker, StartOffset};
use tokio::runtime::Runtime;

fn bench_publish(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    rt.block_on(broker.connect()).unwrap();

    let mut group = c.benchmark_group("publish");
    for size in [16usize, 256, 4096] {
        let payload = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| broker.publish("bench.publish", black_box(payload.clone())).unwrap());
        });
    }
    group.finish();
}

fn bench_publish_consume(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let broker = MemoryBroker::new();
    rt.block_on(broker.connect()).unwrap();
    let mut consumer = rt
        .block_on(broker.consumer("bench", "bench.roundtrip", StartOffset::Latest))
        .unwrap();

    c.bench_function("publish_consume", |b| {
        b.iter(|| {
            broker.publish("bench.roundtrip", &b"ping"[..]).unwrap();
            let record = rt.block_on(consumer.recv()).unwrap();
            black_box(record)
        });
    });
}

criterion_group!(benches, bench_publish, bench_publish_consume);
criterion_main!(benches);
