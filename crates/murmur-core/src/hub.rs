//! The broadcast coordinator.
//!
//! A single [`Hub`] task owns the registry of live connections. Every mutation
//! arrives as a command on one bounded queue and is processed to completion
//! before the next, so membership needs no lock and join, leave and broadcast
//! are observed in one global order.
//!
//! Fan-out never waits on a recipient. If a connection's outbound queue is full
//! the connection is evicted on the spot and the remaining recipients are
//! served as if it had never been there.

use murmur_protocol::{codec, Event};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{ConnectionHandle, ConnectionId, Enqueue, Payload};
use crate::store::PersistenceStore;

/// Hub errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HubError {
    /// The ingress queue is full; the request was not accepted.
    #[error("Hub ingress is saturated")]
    Saturated,

    /// The coordinator task is no longer running.
    #[error("Hub is not running")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of registered connections.
    pub max_connections: usize,
    /// Number of history events replayed to a joining connection.
    pub history_limit: usize,
    /// Capacity of the coordinator's command queue.
    pub ingress_capacity: usize,
    /// Deadline for the history query made on each admission.
    pub history_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            history_limit: 50,
            ingress_capacity: 256,
            history_timeout: Duration::from_secs(5),
        }
    }
}

/// Why an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The hub is at its connection limit.
    Capacity,
    /// History replay overflowed the connection's outbound queue.
    HistoryOverrun,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Capacity => f.write_str("capacity"),
            RejectReason::HistoryOverrun => f.write_str("history overrun"),
        }
    }
}

/// Outcome of an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The connection is registered.
    Accepted,
    /// The connection was refused and its outbound queue closed.
    Rejected(RejectReason),
}

impl Admission {
    /// Whether the connection was accepted.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Point-in-time hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Registered connections.
    pub members: usize,
    /// Configured connection limit.
    pub max_connections: usize,
    /// Connections admitted since start.
    pub admitted_total: u64,
    /// Admissions refused since start.
    pub rejected_total: u64,
    /// Connections evicted for falling behind.
    pub evicted_total: u64,
    /// Events fanned out since start.
    pub events_fanned_out: u64,
}

enum Command {
    Register {
        connection: ConnectionHandle,
        reply: oneshot::Sender<Admission>,
    },
    Unregister {
        id: ConnectionId,
    },
    Broadcast {
        event: Event,
    },
    MembershipCount {
        reply: oneshot::Sender<usize>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Cloneable control surface of a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<Command>,
}

impl HubHandle {
    /// Ask the hub to register a connection.
    ///
    /// Resolves once the hub has decided. On acceptance, history and the join
    /// announcement have already been queued by the time this returns.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is not running.
    pub async fn admit(&self, connection: ConnectionHandle) -> Result<Admission, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Register { connection, reply })
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Ask the hub to unregister a connection. Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is not running.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.commands
            .send(Command::Unregister { id })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Submit an event for fan-out without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Saturated`] if the ingress queue is full, in which
    /// case the event is dropped, or [`HubError::Closed`] if the hub is gone.
    pub fn broadcast(&self, event: Event) -> Result<(), HubError> {
        self.commands
            .try_send(Command::Broadcast { event })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HubError::Saturated,
                mpsc::error::TrySendError::Closed(_) => HubError::Closed,
            })
    }

    /// Current number of registered connections.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is not running.
    pub async fn membership_count(&self) -> Result<usize, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::MembershipCount { reply })
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }

    /// Current hub statistics.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub is not running.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .await
            .map_err(|_| HubError::Closed)?;
        response.await.map_err(|_| HubError::Closed)
    }
}

/// The coordinator actor.
pub struct Hub {
    config: HubConfig,
    members: HashMap<ConnectionId, ConnectionHandle>,
    store: Option<Arc<dyn PersistenceStore>>,
    commands: mpsc::Receiver<Command>,
    totals: HubStats,
}

impl Hub {
    /// Create a hub and its control handle. The hub does nothing until
    /// [`Hub::run`] is polled.
    #[must_use]
    pub fn new(config: HubConfig, store: Option<Arc<dyn PersistenceStore>>) -> (Self, HubHandle) {
        let (sender, commands) = mpsc::channel(config.ingress_capacity.max(1));
        let totals = HubStats {
            max_connections: config.max_connections,
            ..HubStats::default()
        };
        let hub = Self {
            config,
            members: HashMap::new(),
            store,
            commands,
            totals,
        };
        (hub, HubHandle { commands: sender })
    }

    /// Create a hub and run it on a new task.
    #[must_use]
    pub fn spawn(config: HubConfig, store: Option<Arc<dyn PersistenceStore>>) -> HubHandle {
        let (hub, handle) = Self::new(config, store);
        tokio::spawn(hub.run());
        handle
    }

    /// Process commands until every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        info!(
            max_connections = self.config.max_connections,
            history_limit = self.config.history_limit,
            "Hub started"
        );

        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register { connection, reply } => {
                    let admission = self.register(connection).await;
                    let _ = reply.send(admission);
                }
                Command::Unregister { id } => self.unregister(id),
                Command::Broadcast { event } => self.broadcast(&event),
                Command::MembershipCount { reply } => {
                    let _ = reply.send(self.members.len());
                }
                Command::Stats { reply } => {
                    let _ = reply.send(HubStats {
                        members: self.members.len(),
                        ..self.totals
                    });
                }
            }
        }

        info!(members = self.members.len(), "Hub stopped");
    }

    async fn register(&mut self, connection: ConnectionHandle) -> Admission {
        let id = connection.id();
        let username = connection.username().to_string();

        if self.members.len() >= self.config.max_connections {
            warn!(
                connection = %id,
                username = %username,
                max = self.config.max_connections,
                "Maximum number of clients reached, rejecting connection"
            );
            self.totals.rejected_total += 1;
            // Dropping the handle closes the outbound queue.
            return Admission::Rejected(RejectReason::Capacity);
        }

        self.members.insert(id, connection);
        info!(
            connection = %id,
            username = %username,
            members = self.members.len(),
            "Client connected"
        );

        if !self.replay_history(id).await {
            self.totals.rejected_total += 1;
            return Admission::Rejected(RejectReason::HistoryOverrun);
        }

        self.totals.admitted_total += 1;
        let delivered = self.fan_out(&Event::user_joined(&username), Some(id));
        debug!(connection = %id, recipients = delivered, "Announced join");

        Admission::Accepted
    }

    /// Queue recent history, oldest first, to a newly registered connection.
    ///
    /// Returns `false` if the connection was evicted while replaying.
    async fn replay_history(&mut self, id: ConnectionId) -> bool {
        let Some(store) = self.store.clone() else {
            return true;
        };
        if self.config.history_limit == 0 {
            return true;
        }

        // The query runs on the coordinator; a stalled store must not stall the hub.
        let query = store.recent_history(self.config.history_limit);
        let mut history = match time::timeout(self.config.history_timeout, query).await {
            Ok(Ok(history)) => history,
            Ok(Err(e)) => {
                warn!(connection = %id, error = %e, "Failed to load history");
                return true;
            }
            Err(_) => {
                warn!(
                    connection = %id,
                    timeout_ms = self.config.history_timeout.as_millis() as u64,
                    "Loading history timed out, skipping replay"
                );
                return true;
            }
        };
        // Stores hand back newest first.
        history.reverse();

        let Some(member) = self.members.get(&id) else {
            return false;
        };

        let mut overrun = false;
        let count = history.len();
        for record in history {
            let payload = match codec::encode(&record.into_replay()) {
                Ok(text) => Payload::from(text),
                Err(e) => {
                    error!(connection = %id, error = %e, "Failed to encode history event");
                    continue;
                }
            };
            if member.try_enqueue(payload) != Enqueue::Queued {
                overrun = true;
                break;
            }
        }

        if overrun {
            warn!(connection = %id, "Outbound queue full during history replay");
            self.evict(id);
            return false;
        }

        debug!(connection = %id, count, "Replayed history");
        true
    }

    fn unregister(&mut self, id: ConnectionId) {
        let Some(member) = self.members.remove(&id) else {
            trace!(connection = %id, "Unregister for non-member ignored");
            return;
        };
        let username = member.username().to_string();
        drop(member);

        info!(
            connection = %id,
            username = %username,
            members = self.members.len(),
            "Client disconnected"
        );
        self.fan_out(&Event::user_left(username), None);
    }

    fn broadcast(&mut self, event: &Event) {
        let delivered = self.fan_out(event, None);
        trace!(event = %event.id, recipients = delivered, "Broadcast");
    }

    /// Queue an event to every member except `exclude`.
    ///
    /// Returns the number of connections the event was queued to.
    fn fan_out(&mut self, event: &Event, exclude: Option<ConnectionId>) -> usize {
        let payload = match codec::encode(event) {
            Ok(text) => Payload::from(text),
            Err(e) => {
                error!(event = %event.id, error = %e, "Failed to encode event");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut lagging = Vec::new();
        for (id, member) in &self.members {
            if Some(*id) == exclude {
                continue;
            }
            match member.try_enqueue(Arc::clone(&payload)) {
                Enqueue::Queued => delivered += 1,
                Enqueue::Full => lagging.push(*id),
                // The write pump is gone; its read side will unregister.
                Enqueue::Closed => trace!(connection = %id, "Skipping closed queue"),
            }
        }

        for id in lagging {
            self.evict(id);
        }

        self.totals.events_fanned_out += 1;
        delivered
    }

    /// Remove a member without announcing it.
    fn evict(&mut self, id: ConnectionId) {
        if let Some(member) = self.members.remove(&id) {
            self.totals.evicted_total += 1;
            warn!(
                connection = %id,
                username = %member.username(),
                members = self.members.len(),
                "Send queue full, evicting client"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, OutboundQueue};
    use crate::store::{MemoryStore, StoreError, StoredEvent};
    use chrono::{Duration, Utc};
    use murmur_protocol::EventKind;
    use tokio::sync::mpsc::error::TryRecvError;

    fn spawn_hub(max_connections: usize) -> HubHandle {
        Hub::spawn(
            HubConfig {
                max_connections,
                ..HubConfig::default()
            },
            None,
        )
    }

    async fn join(hub: &HubHandle, name: &str, capacity: usize) -> (ConnectionId, OutboundQueue) {
        let (handle, queue) = Connection::open(name, capacity);
        let id = handle.id();
        assert_eq!(hub.admit(handle).await.unwrap(), Admission::Accepted);
        (id, queue)
    }

    fn next_event(queue: &mut OutboundQueue) -> Event {
        let payload = queue.try_recv().expect("expected a queued event");
        codec::decode_event(&payload).unwrap()
    }

    fn assert_empty(queue: &mut OutboundQueue) {
        assert!(matches!(queue.try_recv(), Err(TryRecvError::Empty)));
    }

    fn drain(queue: &mut OutboundQueue) {
        while queue.try_recv().is_ok() {}
    }

    /// Commands are processed in order, so a round trip means everything
    /// sent before it has been handled.
    async fn settle(hub: &HubHandle) -> usize {
        hub.membership_count().await.unwrap()
    }

    #[tokio::test]
    async fn test_admission_limit() {
        let hub = spawn_hub(4);
        let mut queues = Vec::new();
        for n in 0..4 {
            queues.push(join(&hub, &format!("user{n}"), 16).await);
        }

        let (fifth, mut fifth_queue) = Connection::open("late", 16);
        assert_eq!(
            hub.admit(fifth).await.unwrap(),
            Admission::Rejected(RejectReason::Capacity)
        );
        assert!(fifth_queue.recv().await.is_none());
        assert_eq!(settle(&hub).await, 4);

        hub.broadcast(Event::message("user0", "hello")).unwrap();
        assert_eq!(settle(&hub).await, 4);
        for (_, queue) in &mut queues {
            drain(queue);
        }
        assert!(fifth_queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_join_announced_to_others_only() {
        let hub = spawn_hub(4);
        let mut existing = Vec::new();
        for name in ["a", "b", "c"] {
            existing.push(join(&hub, name, 16).await);
        }
        for (_, queue) in &mut existing {
            drain(queue);
        }

        let (_, mut newcomer) = join(&hub, "d", 16).await;

        for (_, queue) in &mut existing {
            let event = next_event(queue);
            assert_eq!(event.kind, EventKind::UserJoined);
            assert_eq!(event.username, "d");
            assert_empty(queue);
        }
        assert_empty(&mut newcomer);
    }

    #[tokio::test]
    async fn test_leave_announced_to_remaining() {
        let hub = spawn_hub(4);
        let mut members = Vec::new();
        for name in ["a", "b", "c", "d"] {
            members.push(join(&hub, name, 16).await);
        }
        for (_, queue) in &mut members {
            drain(queue);
        }

        let (leaving_id, mut leaving_queue) = members.remove(0);
        hub.unregister(leaving_id).await.unwrap();
        assert_eq!(settle(&hub).await, 3);

        for (_, queue) in &mut members {
            let event = next_event(queue);
            assert_eq!(event.kind, EventKind::UserLeft);
            assert_eq!(event.username, "a");
            assert_empty(queue);
        }
        assert!(leaving_queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = spawn_hub(4);
        let (a, _a_queue) = join(&hub, "a", 16).await;
        let (_, mut b_queue) = join(&hub, "b", 16).await;

        hub.unregister(a).await.unwrap();
        hub.unregister(a).await.unwrap();
        hub.unregister(ConnectionId::next()).await.unwrap();
        assert_eq!(settle(&hub).await, 1);

        assert_eq!(next_event(&mut b_queue).kind, EventKind::UserLeft);
        assert_empty(&mut b_queue);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_in_order() {
        let hub = spawn_hub(4);
        let (_, mut a) = join(&hub, "a", 16).await;
        let (_, mut b) = join(&hub, "b", 16).await;
        drain(&mut a);

        for n in 0..3 {
            hub.broadcast(Event::message("a", format!("m{n}"))).unwrap();
        }
        settle(&hub).await;

        for queue in [&mut a, &mut b] {
            for n in 0..3 {
                let event = next_event(queue);
                assert_eq!(event.kind, EventKind::Message);
                assert_eq!(event.content, format!("m{n}"));
            }
            assert_empty(queue);
        }
    }

    #[tokio::test]
    async fn test_history_replayed_oldest_first_before_live() {
        let store = Arc::new(MemoryStore::new());
        let base = Utc::now() - Duration::minutes(10);
        for n in 0..3 {
            store
                .append(&StoredEvent::new(
                    "old",
                    format!("h{n}"),
                    base + Duration::seconds(n),
                    EventKind::Message,
                ))
                .await
                .unwrap();
        }
        let hub = Hub::spawn(HubConfig::default(), Some(store));

        let (_, mut a) = join(&hub, "a", 16).await;
        hub.broadcast(Event::message("a", "live")).unwrap();
        settle(&hub).await;

        for n in 0..3 {
            let event = next_event(&mut a);
            assert_eq!(event.kind, EventKind::Message);
            assert_eq!(event.content, format!("h{n}"));
            assert_eq!(event.timestamp, base + Duration::seconds(n));
        }
        assert_eq!(next_event(&mut a).content, "live");
        assert_empty(&mut a);
    }

    #[tokio::test]
    async fn test_history_only_to_joiner() {
        let store = Arc::new(MemoryStore::new());
        store
            .append(&StoredEvent::new("old", "h", Utc::now(), EventKind::Message))
            .await
            .unwrap();
        let hub = Hub::spawn(HubConfig::default(), Some(store));

        let (_, mut a) = join(&hub, "a", 16).await;
        drain(&mut a);
        let (_, _b) = join(&hub, "b", 16).await;

        assert_eq!(next_event(&mut a).kind, EventKind::UserJoined);
        assert_empty(&mut a);
    }

    /// A store whose history query never completes.
    struct StalledStore;

    #[async_trait::async_trait]
    impl PersistenceStore for StalledStore {
        async fn append(&self, _event: &StoredEvent) -> Result<(), StoreError> {
            Ok(())
        }

        async fn recent_history(&self, _limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_history_does_not_block_hub() {
        let hub = Hub::spawn(
            HubConfig {
                history_timeout: std::time::Duration::from_millis(100),
                ..HubConfig::default()
            },
            Some(Arc::new(StalledStore)),
        );

        let (_, mut a) = join(&hub, "a", 16).await;
        assert_empty(&mut a);
        let (_, _b) = join(&hub, "b", 16).await;

        assert_eq!(settle(&hub).await, 2);
        assert_eq!(next_event(&mut a).kind, EventKind::UserJoined);

        hub.broadcast(Event::message("a", "still flowing")).unwrap();
        settle(&hub).await;
        assert_eq!(next_event(&mut a).content, "still flowing");
    }

    #[tokio::test]
    async fn test_slow_consumer_is_evicted() {
        let hub = spawn_hub(4);
        let (_, mut slow) = join(&hub, "slow", 1).await;
        let (_, mut fast) = join(&hub, "fast", 16).await;
        // `slow` now holds the join announcement and is full.

        hub.broadcast(Event::message("fast", "one")).unwrap();
        hub.broadcast(Event::message("fast", "two")).unwrap();
        assert_eq!(settle(&hub).await, 1);

        assert_eq!(next_event(&mut fast).content, "one");
        assert_eq!(next_event(&mut fast).content, "two");
        assert_empty(&mut fast);

        assert_eq!(next_event(&mut slow).kind, EventKind::UserJoined);
        assert!(slow.recv().await.is_none());

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.evicted_total, 1);
        assert_eq!(stats.members, 1);
    }

    #[tokio::test]
    async fn test_history_overrun_rejects_joiner() {
        let store = Arc::new(MemoryStore::new());
        for n in 0..5 {
            store
                .append(&StoredEvent::new("old", format!("h{n}"), Utc::now(), EventKind::Message))
                .await
                .unwrap();
        }
        let hub = Hub::spawn(HubConfig::default(), Some(store));
        let (_, mut a) = join(&hub, "a", 16).await;
        drain(&mut a);

        let (tiny, _tiny_queue) = Connection::open("tiny", 2);
        assert_eq!(
            hub.admit(tiny).await.unwrap(),
            Admission::Rejected(RejectReason::HistoryOverrun)
        );
        assert_eq!(settle(&hub).await, 1);
        assert_empty(&mut a);
    }

    #[tokio::test]
    async fn test_stats() {
        let hub = spawn_hub(1);
        let (_, _a) = join(&hub, "a", 16).await;
        let (b, _b_queue) = Connection::open("b", 16);
        assert!(!hub.admit(b).await.unwrap().is_accepted());

        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.members, 1);
        assert_eq!(stats.max_connections, 1);
        assert_eq!(stats.admitted_total, 1);
        assert_eq!(stats.rejected_total, 1);
    }

    #[tokio::test]
    async fn test_handle_reports_closed_hub() {
        let (hub, handle) = Hub::new(HubConfig::default(), None);
        drop(hub);
        assert_eq!(handle.membership_count().await, Err(HubError::Closed));
        assert_eq!(
            handle.broadcast(Event::message("a", "b")),
            Err(HubError::Closed)
        );
    }

    #[tokio::test]
    async fn test_saturated_ingress() {
        let (hub, handle) = Hub::new(
            HubConfig {
                ingress_capacity: 1,
                ..HubConfig::default()
            },
            None,
        );
        handle.broadcast(Event::message("a", "1")).unwrap();
        assert_eq!(
            handle.broadcast(Event::message("a", "2")),
            Err(HubError::Saturated)
        );
        drop(hub);
    }
}
