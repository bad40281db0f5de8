//! End-to-end throughput benchmark for Roomcast.
//!
//! Subscribers connect over WebSocket while a publisher posts to the ingress
//! endpoint, so every message crosses real network I/O in both directions.

use futures_util::{SinkExt, StreamExt};
use roomcast_bench::BENCH_CLUSTER;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_WS_URL: &str = "ws://127.0.0.1:8080/";
const SERVER_PUBLISH_URL: &str = "http://127.0.0.1:8080/publish";
const BENCH_ROOM: &str = "e2e";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let num_publishers = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(4);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║        Roomcast End-to-End Throughput Benchmark              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_pubsub_benchmark(num_clients, num_publishers).await;
}

async fn run_pubsub_benchmark(num_clients: usize, num_publishers: usize) {
    println!(
        "📊 Pub/Sub Benchmark: {} subscribers, {} publishers",
        num_clients, num_publishers
    );
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let published = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let received = Arc::clone(&received);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_subscriber(received, barrier).await {
                eprintln!("Subscriber {} error: {}", client_id, e);
            }
        }));
    }

    // Wait for all subscribers to join the room
    barrier.wait().await;
    println!("✓ All {} subscribers connected", num_clients);

    let http = reqwest::Client::new();
    for publisher_id in 0..num_publishers {
        let http = http.clone();
        let published = Arc::clone(&published);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_publisher(http, published).await {
                eprintln!("Publisher {} error: {}", publisher_id, e);
            }
        }));
    }

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    published.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_received = received.load(Ordering::SeqCst);
    let total_published = published.load(Ordering::SeqCst);

    let publishes_per_sec = total_published as f64 / elapsed.as_secs_f64();
    let deliveries_per_sec = total_received as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Subscribers:          {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Publishes:            {:>10}                           ║",
        total_published
    );
    println!(
        "║  Deliveries:           {:>10}                           ║",
        total_received
    );
    println!(
        "║  Publish rate:         {:>10.0} msg/s                    ║",
        publishes_per_sec
    );
    println!(
        "║  Delivery rate:        {:>10.0} msg/s                    ║",
        deliveries_per_sec
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

async fn run_subscriber(received: Arc<AtomicU64>, barrier: Arc<Barrier>) -> Result<(), BoxError> {
    let (ws, _) = connect_async(SERVER_WS_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    let subscribe = serde_json::json!({
        "event": "subscribe",
        "cluster": BENCH_CLUSTER,
        "room": BENCH_ROOM,
    });
    sender.send(Message::Text(subscribe.to_string())).await?;

    // Subscriptions are not acknowledged; proceed once the frame is sent
    barrier.wait().await;

    while let Some(result) = receiver.next().await {
        match result? {
            Message::Text(_) | Message::Binary(_) => {
                received.fetch_add(1, Ordering::Relaxed);
            }
            Message::Close(frame) => {
                return Err(format!("closed by server: {frame:?}").into());
            }
            _ => {}
        }
    }
    Ok(())
}

async fn run_publisher(http: reqwest::Client, published: Arc<AtomicU64>) -> Result<(), BoxError> {
    let body = serde_json::json!({
        "cluster": BENCH_CLUSTER,
        "room": BENCH_ROOM,
        "data": { "payload": "x".repeat(64) },
    });

    loop {
        let resp = http.post(SERVER_PUBLISH_URL).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(format!("publish failed: {}", resp.status()).into());
        }
        published.fetch_add(1, Ordering::Relaxed);
    }
}
