//! # murmur-server
//!
//! HTTP and WebSocket front end for the Murmur hub.
//!
//! The binary in `main.rs` wires these pieces together; they are exposed as a
//! library so integration tests can run a server on an ephemeral port.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{app, run_server, AppState};
