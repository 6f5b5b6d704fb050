//! Latency benchmarks for Murmur.
//!
//! These benchmarks drive a full connection pump over the in-process
//! transport, so they cover decode, sanitize, hub fan-out and write-back.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use murmur_core::{Connection, Hub, HubConfig, MemoryStore, PersistenceStore};
use murmur_transport::memory::{self, MemoryPeer};
use murmur_transport::{ConnectionPump, PumpConfig};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

const MESSAGE: &str = r#"{"content":"hello there"}"#;

/// Admit `username` and start a pump for it.
async fn start_member(
    hub: &murmur_core::HubHandle,
    username: &str,
    store: Option<Arc<dyn PersistenceStore>>,
) -> (MemoryPeer, JoinHandle<murmur_transport::Teardown>) {
    let (handle, queue) = Connection::open(username, 256);
    assert!(hub.admit(handle).await.unwrap().is_accepted());

    let (reader, writer, peer) = memory::pair();
    let pump = ConnectionPump::new(username, queue, reader, writer, hub.clone(), PumpConfig::default())
        .with_store(store);
    (peer, tokio::spawn(pump.run()))
}

/// Send a message and wait for it to come back to the sender.
fn bench_echo(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("echo");

    group.bench_function("no_store", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let hub = Hub::spawn(HubConfig::default(), None);
            let (mut peer, pump) = start_member(&hub, "alice", None).await;

            let start = Instant::now();
            for _ in 0..iters {
                peer.send_text(MESSAGE);
                black_box(peer.recv().await);
            }
            let elapsed = start.elapsed();

            peer.hang_up();
            let _ = pump.await;
            elapsed
        });
    });

    group.bench_function("memory_store", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let store: Arc<dyn PersistenceStore> = Arc::new(MemoryStore::new());
            let hub = Hub::spawn(HubConfig::default(), Some(Arc::clone(&store)));
            let (mut peer, pump) = start_member(&hub, "alice", Some(store)).await;

            let start = Instant::now();
            for _ in 0..iters {
                peer.send_text(MESSAGE);
                black_box(peer.recv().await);
            }
            let elapsed = start.elapsed();

            peer.hang_up();
            let _ = pump.await;
            elapsed
        });
    });

    group.finish();
}

/// Sender to a full room of four: time until the last member has it.
fn bench_room_delivery(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    c.bench_function("room_of_four", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let hub = Hub::spawn(HubConfig::default(), None);
            let mut members = Vec::new();
            for name in ["alice", "bob", "carol", "dave"] {
                members.push(start_member(&hub, name, None).await);
            }
            // Each member hears the joins that came after it.
            let room = members.len();
            for (i, (peer, _)) in members.iter_mut().enumerate() {
                for _ in i + 1..room {
                    black_box(peer.recv().await);
                }
            }

            let start = Instant::now();
            for _ in 0..iters {
                members[0].0.send_text(MESSAGE);
                for (peer, _) in &mut members {
                    black_box(peer.recv().await);
                }
            }
            let elapsed = start.elapsed();

            for (mut peer, pump) in members {
                peer.hang_up();
                let _ = pump.await;
            }
            elapsed
        });
    });
}

criterion_group!(benches, bench_echo, bench_room_delivery);
criterion_main!(benches);
