//! # murmur-core
//!
//! Core coordination for the Murmur fan-out hub.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - The single actor that owns membership and drives fan-out
//! - **Connection** - Per-connection handle and bounded outbound queue
//! - **Store** - The persistence seam (append + recent history)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌───────────────┐
//! │    Pump     │────▶│     Hub     │────▶│ OutboundQueue │
//! └─────────────┘     └─────────────┘     └───────────────┘
//!        │                   │
//!        ▼                   ▼
//!     ┌─────────────────────────┐
//!     │    PersistenceStore     │
//!     └─────────────────────────┘
//! ```

pub mod connection;
pub mod file_store;
pub mod hub;
pub mod store;

pub use connection::{Connection, ConnectionHandle, ConnectionId, Enqueue, OutboundQueue, Payload};
pub use file_store::FileStore;
pub use hub::{Admission, Hub, HubConfig, HubError, HubHandle, HubStats, RejectReason};
pub use store::{MemoryStore, PersistenceStore, StoreError, StoredEvent};
