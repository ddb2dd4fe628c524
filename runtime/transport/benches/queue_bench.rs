use std::hint::black_box;

use avp_transport::{MessageQueue, MAX_MESSAGE_LEN};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_insert_extract(c: &mut Criterion) {
    let sizes = [4usize, 32, 128, MAX_MESSAGE_LEN];
    let mut group = c.benchmark_group("MessageQueue");

    for size in sizes {
        let queue = MessageQueue::with_depth(30, MAX_MESSAGE_LEN).expect("queue");
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let mut out = [0u8; MAX_MESSAGE_LEN];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("insert_extract", size), &payload, |b, p| {
            b.iter(|| {
                queue.insert(black_box(p)).expect("insert");
                black_box(queue.extract(&mut out).expect("extract"))
            })
        });
    }

    group.finish();
}

fn bench_fill_drain(c: &mut Criterion) {
    let queue = MessageQueue::with_depth(30, MAX_MESSAGE_LEN).expect("queue");
    let payload = [0xa5u8; 64];
    let mut out = [0u8; MAX_MESSAGE_LEN];

    c.bench_function("fill_drain_30x64", |b| {
        b.iter(|| {
            while queue.insert(black_box(&payload)).is_ok() {}
            while let Ok(n) = queue.extract(&mut out) {
                black_box(n);
            }
        })
    });
}

criterion_group!(benches, bench_insert_extract, bench_fill_drain);
criterion_main!(benches);
