//! Codec benchmarks for relay-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_protocol::{codec, Frame};
use serde_json::json;

fn bench_encode_broadcast(c: &mut Criterion) {
    let frame = Frame::broadcast(
        "room:42",
        "content:updated",
        json!({ "content": "x".repeat(64) }),
    );

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("broadcast_64B", |b| {
        b.iter(|| codec::encode(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode_broadcast(c: &mut Criterion) {
    let frame = Frame::broadcast(
        "room:42",
        "content:updated",
        json!({ "content": "x".repeat(64) }),
    );
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("broadcast_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_roundtrip_join(c: &mut Criterion) {
    let frame = Frame::join(1, "room:42", json!({"typing": false, "name": "alice"}));

    c.bench_function("roundtrip_join", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&frame)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_broadcast,
    bench_decode_broadcast,
    bench_roundtrip_join
);
criterion_main!(benches);
