//! Transport abstraction traits for Murmur.
//!
//! A transport is split into a reading half and a writing half so the two
//! pump tasks of a connection never share a lock.

use async_trait::async_trait;
use thiserror::Error;

/// A transport-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload.
    Binary(Vec<u8>),
    /// Liveness ping.
    Ping(Vec<u8>),
    /// Reply to a liveness ping.
    Pong(Vec<u8>),
    /// Close handshake.
    Close,
}

impl WireFrame {
    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) | WireFrame::Ping(data) | WireFrame::Pong(data) => data.len(),
            WireFrame::Close => 0,
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Deadline exceeded.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// The reading half of a transport.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the transport is closed.
    async fn recv(&mut self) -> Option<Result<WireFrame, TransportError>>;
}

/// The writing half of a transport.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Flush and release the transport.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len() {
        assert_eq!(WireFrame::Text("abc".into()).len(), 3);
        assert_eq!(WireFrame::Binary(vec![0; 8]).len(), 8);
        assert!(WireFrame::Close.is_empty());
    }
}
