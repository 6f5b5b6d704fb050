//! End-to-end throughput benchmark for Murmur.
//!
//! Connects real WebSocket clients to a running server. Each client sends a
//! message and waits for its own copy before sending the next, so the server
//! never has to evict anyone for falling behind.
//!
//! ```bash
//! cargo run --release -p murmur-server &
//! cargo run --release -p murmur-bench --bin e2e_throughput -- 4 ws://127.0.0.1:8080/ws
//! ```

use futures_util::{SinkExt, StreamExt};
use murmur_protocol::{decode_event, EventKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(4);
    let url = args.get(2).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("Murmur end-to-end throughput");
    println!("  server:  {url}");
    println!("  clients: {num_clients} (server limit must allow this many)");
    println!("  warmup:  {WARMUP_SECS}s, measurement: {BENCH_SECS}s");
    println!();

    let delivered = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let delivered = Arc::clone(&delivered);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, &url, delivered, barrier).await {
                eprintln!("Client {client_id} error: {e}");
            }
        }));
    }

    barrier.wait().await;
    println!("All {num_clients} clients connected");

    println!("Warming up...");
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("Measuring...");
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("  duration:   {:>10.2}s", elapsed.as_secs_f64());
    println!("  delivered:  {total:>10} events");
    println!("  throughput: {per_sec:>10.0} events/s");
    println!(
        "  per client: {:>10.0} events/s",
        per_sec / num_clients as f64
    );

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: &str,
    delivered: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let username = format!("bench-{client_id}");
    let (ws, _) = connect_async(format!("{url}?username={username}")).await?;
    let (mut sender, mut receiver) = ws.split();

    barrier.wait().await;

    let payload = serde_json::json!({ "content": "x".repeat(64) }).to_string();

    loop {
        sender.send(Message::Text(payload.clone())).await?;

        // Count everything until our own message comes back.
        loop {
            let Some(frame) = receiver.next().await else {
                return Ok(());
            };
            let Message::Text(text) = frame? else {
                continue;
            };
            let event = decode_event(&text)?;
            if event.kind != EventKind::Message {
                continue;
            }
            delivered.fetch_add(1, Ordering::Relaxed);
            if event.username == username {
                break;
            }
        }
    }
}
