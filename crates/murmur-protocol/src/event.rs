//! Event types for the Murmur protocol.
//!
//! An [`Event`] is the unit of fan-out: the hub serializes it once and hands the
//! same encoded text to every recipient.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Text sent by a connected party.
    Message,
    /// A party joined the hub.
    UserJoined,
    /// A party left the hub.
    UserLeft,
}

impl EventKind {
    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::UserJoined => "user_joined",
            EventKind::UserLeft => "user_left",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fan-out event.
///
/// `id` and `timestamp` are always assigned server-side. Use the constructors
/// rather than building the struct by hand so that invariant holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier.
    pub id: String,
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Display identity of the sender (or of the joining/leaving party).
    pub username: String,
    /// Text content.
    pub content: String,
    /// Server-assigned UTC timestamp, RFC 3339 on the wire.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    fn stamped(kind: EventKind, username: String, content: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            username,
            content,
            timestamp,
        }
    }

    /// Create a new `message` event stamped with the current time.
    #[must_use]
    pub fn message(username: impl Into<String>, content: impl Into<String>) -> Self {
        Self::stamped(EventKind::Message, username.into(), content.into(), Utc::now())
    }

    /// Create a `user_joined` presence event.
    #[must_use]
    pub fn user_joined(username: impl Into<String>) -> Self {
        let username = username.into();
        let content = format!("{username} joined the chat");
        Self::stamped(EventKind::UserJoined, username, content, Utc::now())
    }

    /// Create a `user_left` presence event.
    #[must_use]
    pub fn user_left(username: impl Into<String>) -> Self {
        let username = username.into();
        let content = format!("{username} left the chat");
        Self::stamped(EventKind::UserLeft, username, content, Utc::now())
    }

    /// Wrap a historical record as a `message` event.
    ///
    /// The record keeps its original timestamp but gets a fresh id.
    #[must_use]
    pub fn replayed(
        username: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::stamped(EventKind::Message, username.into(), content.into(), timestamp)
    }
}

/// Payload accepted from clients.
///
/// Only `content` is read. Any `id`, `type`, `username` or `timestamp` a client
/// sends is ignored by deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundMessage {
    /// Text content.
    #[serde(default)]
    pub content: String,
}

/// Apply the content policy to a client-supplied string.
///
/// Returns `None` when nothing would be left to deliver. Longer content is
/// cut to `max_chars` characters; a character is never split.
#[must_use]
pub fn sanitize_content(raw: &str, max_chars: usize) -> Option<String> {
    if raw.is_empty() || max_chars == 0 {
        return None;
    }
    match raw.char_indices().nth(max_chars) {
        Some((cut, _)) => Some(raw[..cut].to_string()),
        None => Some(raw.to_string()),
    }
}
