//! Connection handles and outbound queues.
//!
//! A connection is split in two on creation. The [`ConnectionHandle`] holds the
//! sending half of the outbound queue and is moved into the hub on admission;
//! the [`OutboundQueue`] stays with the connection's write pump. Because the hub
//! owns the only sender, dropping the handle closes the queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An encoded event, shared between every recipient of a fan-out.
pub type Payload = Arc<str>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a connection.
///
/// Display identities are caller-supplied and may repeat; the registry is keyed
/// by this id instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Factory for a connection's two halves.
pub struct Connection;

impl Connection {
    /// Open a new connection with a bounded outbound queue.
    ///
    /// A capacity of zero is bumped to one.
    #[must_use]
    pub fn open(
        username: impl Into<String>,
        queue_capacity: usize,
    ) -> (ConnectionHandle, OutboundQueue) {
        let id = ConnectionId::next();
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let handle = ConnectionHandle {
            id,
            username: username.into(),
            sender,
        };
        (handle, OutboundQueue { id, receiver })
    }
}

/// The hub's side of a connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    username: String,
    sender: mpsc::Sender<Payload>,
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The payload was queued.
    Queued,
    /// The queue is at capacity.
    Full,
    /// The write pump has gone away.
    Closed,
}

impl ConnectionHandle {
    /// Connection id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Display identity.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Try to enqueue a payload without waiting.
    pub fn try_enqueue(&self, payload: Payload) -> Enqueue {
        match self.sender.try_send(payload) {
            Ok(()) => Enqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }
}

/// The write pump's side of a connection.
#[derive(Debug)]
pub struct OutboundQueue {
    id: ConnectionId,
    receiver: mpsc::Receiver<Payload>,
}

impl OutboundQueue {
    /// Connection id this queue belongs to.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for the next payload.
    ///
    /// Returns `None` once the hub has closed the queue and every payload
    /// queued before closing has been delivered.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.receiver.recv().await
    }

    /// Take a payload if one is ready.
    pub fn try_recv(&mut self) -> Result<Payload, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[test]
    fn test_open_pairs_handle_and_queue() {
        let (handle, queue) = Connection::open("alice", 4);
        assert_eq!(handle.id(), queue.id());
        assert_eq!(handle.username(), "alice");
    }

    #[test]
    fn test_enqueue_full_and_closed() {
        let (handle, mut queue) = Connection::open("alice", 1);

        assert_eq!(handle.try_enqueue(Arc::from("one")), Enqueue::Queued);
        assert_eq!(handle.try_enqueue(Arc::from("two")), Enqueue::Full);

        assert_eq!(&*queue.try_recv().unwrap(), "one");
        drop(queue);
        assert_eq!(handle.try_enqueue(Arc::from("three")), Enqueue::Closed);
    }

    #[tokio::test]
    async fn test_dropping_handle_closes_queue_after_drain() {
        let (handle, mut queue) = Connection::open("alice", 4);
        handle.try_enqueue(Arc::from("last"));
        drop(handle);

        assert_eq!(queue.recv().await.as_deref(), Some("last"));
        assert!(queue.recv().await.is_none());
    }
}
