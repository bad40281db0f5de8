//! Codec benchmarks for roomcast-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use roomcast_protocol::{codec, RoomName};
use std::collections::BTreeSet;

fn rooms(count: usize) -> BTreeSet<RoomName> {
    (0..count)
        .map(|i| RoomName::derive("bench", &format!("room-{i}")).unwrap())
        .collect()
}

fn bench_encode_attachment(c: &mut Criterion) {
    let small = rooms(4);
    let large = rooms(256);

    let mut group = c.benchmark_group("encode_attachment");
    group.bench_function("4_rooms", |b| b.iter(|| codec::encode(black_box(&small))));
    group.bench_function("256_rooms", |b| b.iter(|| codec::encode(black_box(&large))));
    group.finish();
}

fn bench_decode_attachment(c: &mut Criterion) {
    let encoded = codec::encode(&rooms(4)).unwrap();

    let mut group = c.benchmark_group("decode_attachment");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("4_rooms", |b| {
        b.iter(|| codec::decode::<BTreeSet<RoomName>>(black_box(&encoded)))
    });
    group.finish();
}

fn bench_decode_event(c: &mut Criterion) {
    let text = r#"{"event":"subscribe","cluster":"bench","room":"lobby"}"#;

    c.bench_function("decode_subscribe_event", |b| {
        b.iter(|| {
            let event = codec::decode_event(black_box(text)).unwrap();
            event.room().unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_attachment,
    bench_decode_attachment,
    bench_decode_event
);
criterion_main!(benches);
