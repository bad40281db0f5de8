//! Latency benchmarks for Roomcast.
//!
//! These benchmarks focus on measuring end-to-end latency through the actors.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use roomcast_bench::{payload, room, runtime, subscribed_cluster};
use roomcast_core::coordinator;
use roomcast_core::{Partition, PartitionConfig};
use roomcast_protocol::{codec, PartitionId, PublishRequest};
use roomcast_transport::{local, Connection};
use std::time::{Duration, Instant};

/// Benchmark client event decoding.
fn bench_decode_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_event");
    let text = r#"{"event":"subscribe","cluster":"bench","room":"latency"}"#;

    group.bench_function("subscribe", |b| {
        b.iter(|| codec::decode_event(black_box(text)))
    });

    group.finish();
}

/// Benchmark publish-to-receive latency through the coordinator.
fn bench_publish_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("publish_latency");
    let target = room("latency");

    for (name, subscribers) in [("single_subscriber", 1), ("ten_subscribers", 10)] {
        group.bench_function(name, |b| {
            let (cluster, mut receivers) =
                rt.block_on(subscribed_cluster(&target, subscribers, 1000));
            let request = PublishRequest::new(target.clone(), payload(64));

            b.iter_custom(|iters| {
                rt.block_on(async {
                    let start = Instant::now();
                    for _ in 0..iters {
                        cluster.publish(request.clone()).await.unwrap();
                        for rx in &mut receivers {
                            black_box(rx.recv().await);
                        }
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

/// Benchmark a subscribe answered from the room cache, through the actor.
fn bench_cached_subscribe(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("cached_subscribe");
    let text = r#"{"event":"subscribe","cluster":"bench","room":"cached"}"#;

    group.bench_function("actor_roundtrip", |b| {
        b.iter_custom(|iters| {
            rt.block_on(async {
                let (handle, _mailbox) = coordinator::mailbox();
                let (partition, _task) =
                    Partition::new(PartitionId::new("bench"), handle, PartitionConfig::default())
                        .spawn();
                partition
                    .publish(PublishRequest::new(room("cached"), payload(64)))
                    .await
                    .unwrap();

                let mut elapsed = Duration::ZERO;
                for _ in 0..iters {
                    let (conn, mut rx) = local::pair();
                    partition.accept(conn.clone()).await.unwrap();

                    let start = Instant::now();
                    partition.message(conn.id(), text).await.unwrap();
                    black_box(rx.recv().await);
                    elapsed += start.elapsed();

                    partition.close(conn.id()).await.unwrap();
                }
                partition.shutdown().await;
                elapsed
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_decode_event,
    bench_publish_latency,
    bench_cached_subscribe,
);
criterion_main!(benches);
