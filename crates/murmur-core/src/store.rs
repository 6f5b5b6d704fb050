//! Persistence seam for Murmur.
//!
//! The hub and the connection pump only ever append events and ask for the most
//! recent history. Anything durable lives behind [`PersistenceStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use murmur_protocol::{Event, EventKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;

/// Default number of events a [`MemoryStore`] retains.
pub const DEFAULT_RETENTION: usize = 1000;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A persisted event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Sender display identity.
    pub username: String,
    /// Text content.
    pub content: String,
    /// Server-assigned timestamp.
    pub timestamp: DateTime<Utc>,
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
}

impl StoredEvent {
    /// Create a new record.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        kind: EventKind,
    ) -> Self {
        Self {
            username: username.into(),
            content: content.into(),
            timestamp,
            kind,
        }
    }

    /// Turn the record into a replayable `message` event.
    #[must_use]
    pub fn into_replay(self) -> Event {
        Event::replayed(self.username, self.content, self.timestamp)
    }
}

impl From<&Event> for StoredEvent {
    fn from(event: &Event) -> Self {
        Self::new(
            event.username.clone(),
            event.content.clone(),
            event.timestamp,
            event.kind,
        )
    }
}

/// Durable append + recent-history query.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Append an event.
    async fn append(&self, event: &StoredEvent) -> Result<(), StoreError>;

    /// Fetch up to `limit` of the most recent `message` events, newest first.
    async fn recent_history(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError>;

    /// Short name for health reporting.
    fn name(&self) -> &'static str;
}

/// An in-process store with bounded retention.
#[derive(Debug)]
pub struct MemoryStore {
    events: Mutex<VecDeque<StoredEvent>>,
    retention: usize,
}

impl MemoryStore {
    /// Create a store with the default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a store that keeps at most `retention` events.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(retention.min(4096))),
            retention: retention.max(1),
        }
    }

    /// Number of retained events.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn append(&self, event: &StoredEvent) -> Result<(), StoreError> {
        let mut events = self.events.lock().await;
        if events.len() == self.retention {
            events.pop_front();
        }
        events.push_back(event.clone());
        trace!(username = %event.username, retained = events.len(), "Stored event");
        Ok(())
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let events = self.events.lock().await;
        Ok(events
            .iter()
            .rev()
            .filter(|e| e.kind == EventKind::Message)
            .take(limit)
            .cloned()
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> StoredEvent {
        StoredEvent::new("alice", format!("msg {n}"), Utc::now(), EventKind::Message)
    }

    #[tokio::test]
    async fn test_recent_history_newest_first() {
        let store = MemoryStore::new();
        for n in 0..5 {
            store.append(&record(n)).await.unwrap();
        }

        let history = store.recent_history(3).await.unwrap();
        let contents: Vec<&str> = history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 4", "msg 3", "msg 2"]);
    }

    #[tokio::test]
    async fn test_retention_drops_oldest() {
        let store = MemoryStore::with_retention(2);
        for n in 0..3 {
            store.append(&record(n)).await.unwrap();
        }

        assert_eq!(store.len().await, 2);
        let history = store.recent_history(10).await.unwrap();
        assert_eq!(history.last().unwrap().content, "msg 1");
    }

    #[tokio::test]
    async fn test_history_skips_presence() {
        let store = MemoryStore::new();
        store.append(&record(0)).await.unwrap();
        store
            .append(&StoredEvent::new("bob", "bob joined the chat", Utc::now(), EventKind::UserJoined))
            .await
            .unwrap();

        let history = store.recent_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].username, "alice");
    }

    #[test]
    fn test_into_replay() {
        let stored = record(7);
        let ts = stored.timestamp;
        let event = stored.into_replay();
        assert_eq!(event.kind, EventKind::Message);
        assert_eq!(event.timestamp, ts);
        assert_eq!(event.content, "msg 7");
    }
}
