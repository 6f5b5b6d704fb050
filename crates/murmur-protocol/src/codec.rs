//! Codec for encoding and decoding Murmur frames.
//!
//! Frames are JSON text. The server encodes each outbound [`Event`] once and
//! shares the resulting string between recipients.

use thiserror::Error;

use crate::event::{Event, InboundMessage};

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Frame is not valid UTF-8.
    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an event to its wire text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(event: &Event) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

/// Decode a client payload.
///
/// # Errors
///
/// Returns an error if the text is not a JSON object with a string `content`.
pub fn decode_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a full event, as a client receives it.
///
/// # Errors
///
/// Returns an error if the text is not a valid event.
pub fn decode_event(text: &str) -> Result<Event, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Check a raw frame against a size limit.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if `len` exceeds `max`.
pub fn check_frame_size(len: usize, max: usize) -> Result<(), ProtocolError> {
    if len > max {
        return Err(ProtocolError::FrameTooLarge { size: len, max });
    }
    Ok(())
}

/// Interpret a binary frame as text.
///
/// # Errors
///
/// Returns [`ProtocolError::NotUtf8`] if the bytes are not UTF-8.
pub fn binary_to_text(data: Vec<u8>) -> Result<String, ProtocolError> {
    String::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)
}
