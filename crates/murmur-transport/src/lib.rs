//! # murmur-transport
//!
//! Per-connection I/O for the Murmur fan-out hub.
//!
//! - **Pump** - Read side, write side and keepalive for one connection
//! - **Transport traits** - A minimal duplex frame interface the pump runs over
//! - **WebSocket** - The axum WebSocket adapter
//! - **Memory** - An in-process transport for tests and benchmarks
//!
//! ```rust,ignore
//! use murmur_transport::{websocket, ConnectionPump};
//!
//! let (reader, writer) = websocket::split(socket);
//! let teardown = ConnectionPump::new(username, queue, reader, writer, hub, config)
//!     .with_store(store)
//!     .run()
//!     .await;
//! ```

pub mod memory;
pub mod pump;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use pump::{ConnectionPump, PumpConfig, Teardown};
pub use traits::{FrameReader, FrameWriter, TransportError, WireFrame};
