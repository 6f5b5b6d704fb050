//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to [`FrameReader`] / [`FrameWriter`].
//! Pings from the peer are answered by the WebSocket layer itself.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::trace;

use crate::traits::{FrameReader, FrameWriter, TransportError, WireFrame};

/// Close code sent when the hub refuses a connection ("try again later").
pub const CLOSE_TRY_AGAIN: u16 = axum::extract::ws::close_code::AGAIN;

/// Reading half of a WebSocket.
pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

/// Writing half of a WebSocket.
pub struct WsWriter {
    sink: SplitSink<WebSocket, Message>,
}

/// Split an upgraded socket into pump halves.
#[must_use]
pub fn split(socket: WebSocket) -> (WsReader, WsWriter) {
    let (sink, stream) = socket.split();
    (WsReader { stream }, WsWriter { sink })
}

/// Close a socket that will never be pumped, with a code and reason.
///
/// # Errors
///
/// Returns an error if the close frame cannot be written.
pub async fn refuse(
    mut socket: WebSocket,
    code: u16,
    reason: impl Into<String>,
) -> Result<(), TransportError> {
    let reason: String = reason.into();
    socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

#[async_trait]
impl FrameReader for WsReader {
    async fn recv(&mut self) -> Option<Result<WireFrame, TransportError>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(TransportError::ReceiveFailed(e.to_string()))),
        };

        let frame = match message {
            Message::Text(text) => WireFrame::Text(text),
            Message::Binary(data) => WireFrame::Binary(data),
            Message::Ping(data) => WireFrame::Ping(data),
            Message::Pong(data) => WireFrame::Pong(data),
            Message::Close(frame) => {
                trace!(close = ?frame, "Received close frame");
                WireFrame::Close
            }
        };
        Some(Ok(frame))
    }
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data),
            WireFrame::Ping(data) => Message::Ping(data),
            WireFrame::Pong(data) => Message::Pong(data),
            WireFrame::Close => Message::Close(None),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
