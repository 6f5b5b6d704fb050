//! In-process transport.
//!
//! Pairs a pump-side reader/writer with a [`MemoryPeer`] that plays the remote
//! party. Used by tests and benchmarks to drive a pump without sockets.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::traits::{FrameReader, FrameWriter, TransportError, WireFrame};

/// Reading half handed to the pump.
pub struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<Result<WireFrame, TransportError>>,
}

/// Writing half handed to the pump.
pub struct MemoryWriter {
    outbound: mpsc::UnboundedSender<WireFrame>,
    fail_writes: Arc<AtomicBool>,
    stalled: watch::Receiver<bool>,
}

/// The remote end of an in-process transport.
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<WireFrame, TransportError>>>,
    outbound: mpsc::UnboundedReceiver<WireFrame>,
    fail_writes: Arc<AtomicBool>,
    stalled: watch::Sender<bool>,
}

/// Create a connected reader, writer and peer.
#[must_use]
pub fn pair() -> (MemoryReader, MemoryWriter, MemoryPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let fail_writes = Arc::new(AtomicBool::new(false));
    let (stalled, stalled_rx) = watch::channel(false);

    (
        MemoryReader { inbound: in_rx },
        MemoryWriter {
            outbound: out_tx,
            fail_writes: Arc::clone(&fail_writes),
            stalled: stalled_rx,
        },
        MemoryPeer {
            inbound: Some(in_tx),
            outbound: out_rx,
            fail_writes,
            stalled,
        },
    )
}

impl MemoryPeer {
    /// Deliver a frame to the pump's reader.
    pub fn send(&self, frame: WireFrame) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Ok(frame));
        }
    }

    /// Deliver a text frame to the pump's reader.
    pub fn send_text(&self, text: impl Into<String>) {
        self.send(WireFrame::Text(text.into()));
    }

    /// Make the pump's next read fail.
    pub fn inject_error(&self, error: TransportError) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Err(error));
        }
    }

    /// Close the read direction, as if the remote hung up.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Make every subsequent write hang until [`resume_writes`](Self::resume_writes).
    pub fn stall_writes(&self) {
        self.stalled.send_replace(true);
    }

    /// Let stalled and subsequent writes through again.
    pub fn resume_writes(&self) {
        self.stalled.send_replace(false);
    }

    /// Wait for the next frame the pump wrote.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.outbound.recv().await
    }

    /// Take a written frame if one is ready.
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.outbound.try_recv().ok()
    }
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Option<Result<WireFrame, TransportError>> {
        self.inbound.recv().await
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        if self.stalled.wait_for(|stalled| !stalled).await.is_err() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("peer unavailable".into()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
