//! # murmur-protocol
//!
//! Wire protocol definitions for the Murmur fan-out hub.
//!
//! Every frame on the wire is a UTF-8 JSON object carried in a WebSocket text
//! message. Outbound frames are complete [`Event`]s; inbound frames only need a
//! `content` field, everything else is assigned by the server.
//!
//! ## Event Kinds
//!
//! - `message` - Text sent by a connected party (or replayed from history)
//! - `user_joined` / `user_left` - Presence events synthesized by the hub
//!
//! ## Example
//!
//! ```rust
//! use murmur_protocol::{codec, Event, EventKind};
//!
//! let event = Event::message("alice", "Hello, world!");
//! let encoded = codec::encode(&event).unwrap();
//! let decoded = codec::decode_event(&encoded).unwrap();
//! assert_eq!(decoded.kind, EventKind::Message);
//!
//! // Clients only send content; the rest is ignored.
//! let inbound = codec::decode_inbound(r#"{"content":"hi","username":"mallory"}"#).unwrap();
//! assert_eq!(inbound.content, "hi");
//! ```

pub mod codec;
pub mod event;

pub use codec::{decode_event, decode_inbound, encode, ProtocolError};
pub use event::{sanitize_content, Event, EventKind, InboundMessage};
