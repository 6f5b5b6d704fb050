//! The per-connection duplex pump.
//!
//! Each admitted connection runs two tasks:
//!
//! - the **write side** drains the outbound queue onto the transport and sends
//!   a ping whenever the keepalive timer fires;
//! - the **read side** decodes inbound frames, stamps them, persists them on a
//!   best-effort basis and hands them to the hub.
//!
//! The read side is the only teardown path. Whatever ends it (remote close,
//! transport error, liveness timeout, oversized frame, or the write side
//! giving up) it unregisters the connection from the hub, which closes the
//! outbound queue and lets the write side send a close frame and exit.

use murmur_core::{ConnectionId, HubError, HubHandle, OutboundQueue, PersistenceStore, StoredEvent};
use murmur_protocol::{codec, sanitize_content, Event};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::traits::{FrameReader, FrameWriter, TransportError, WireFrame};

/// Pump limits and timeouts.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_size: usize,
    /// Longest message content kept, in characters.
    pub max_content_length: usize,
    /// How long the read side waits for any inbound frame.
    pub pong_timeout: Duration,
    /// How often the write side sends a ping.
    pub ping_interval: Duration,
    /// Deadline for each outbound write.
    pub write_timeout: Duration,
    /// Deadline for each persistence append.
    pub persist_timeout: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 4096,
            max_content_length: 500,
            pong_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(54),
            write_timeout: Duration::from_secs(10),
            persist_timeout: Duration::from_secs(5),
        }
    }
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum Teardown {
    /// The remote closed the transport.
    Closed,
    /// Reading failed.
    Transport(TransportError),
    /// Nothing was received within the liveness window.
    LivenessTimeout,
    /// An inbound frame exceeded the size limit.
    Oversized(usize),
    /// The write side stopped.
    WriterGone,
    /// The hub is no longer running.
    HubGone,
}

impl Teardown {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Teardown::Closed => "closed",
            Teardown::Transport(_) => "transport",
            Teardown::LivenessTimeout => "liveness_timeout",
            Teardown::Oversized(_) => "oversized_frame",
            Teardown::WriterGone => "write_failed",
            Teardown::HubGone => "hub_gone",
        }
    }
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Teardown::Closed => f.write_str("closed by peer"),
            Teardown::Transport(e) => write!(f, "transport error: {e}"),
            Teardown::LivenessTimeout => f.write_str("liveness timeout"),
            Teardown::Oversized(size) => write!(f, "oversized frame ({size} bytes)"),
            Teardown::WriterGone => f.write_str("write side stopped"),
            Teardown::HubGone => f.write_str("hub stopped"),
        }
    }
}

/// Drives one admitted connection.
pub struct ConnectionPump<R, W> {
    id: ConnectionId,
    username: String,
    reader: R,
    writer: W,
    queue: OutboundQueue,
    hub: HubHandle,
    store: Option<Arc<dyn PersistenceStore>>,
    config: PumpConfig,
}

impl<R, W> ConnectionPump<R, W>
where
    R: FrameReader + 'static,
    W: FrameWriter + 'static,
{
    /// Create a pump for a connection the hub has accepted.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        queue: OutboundQueue,
        reader: R,
        writer: W,
        hub: HubHandle,
        config: PumpConfig,
    ) -> Self {
        Self {
            id: queue.id(),
            username: username.into(),
            reader,
            writer,
            queue,
            hub,
            store: None,
            config,
        }
    }

    /// Persist accepted messages to `store`.
    #[must_use]
    pub fn with_store(mut self, store: Option<Arc<dyn PersistenceStore>>) -> Self {
        self.store = store;
        self
    }

    /// Run until the connection is torn down.
    pub async fn run(self) -> Teardown {
        let Self {
            id,
            username,
            reader,
            writer,
            queue,
            hub,
            store,
            config,
        } = self;

        let (writer_done, writer_gone) = oneshot::channel();
        let mut write_task = tokio::spawn(write_loop(id, writer, queue, config.clone(), writer_done));

        let read_side = ReadSide {
            id,
            username,
            hub,
            store,
            config,
        };
        let teardown = read_side.run(reader, writer_gone).await;
        info!(connection = %id, username = %read_side.username, reason = %teardown, "Connection closing");

        if let Err(e) = read_side.hub.unregister(id).await {
            debug!(connection = %id, error = %e, "Unregister skipped");
        }

        // Unregistering closed the queue; give the write side one write
        // deadline to send its close frame.
        if time::timeout(read_side.config.write_timeout, &mut write_task)
            .await
            .is_err()
        {
            debug!(connection = %id, "Write side did not finish, aborting");
            write_task.abort();
        }

        teardown
    }
}

struct ReadSide {
    id: ConnectionId,
    username: String,
    hub: HubHandle,
    store: Option<Arc<dyn PersistenceStore>>,
    config: PumpConfig,
}

impl ReadSide {
    async fn run<R: FrameReader>(
        &self,
        mut reader: R,
        mut writer_gone: oneshot::Receiver<()>,
    ) -> Teardown {
        let mut last_seen = Instant::now();

        loop {
            let deadline = last_seen + self.config.pong_timeout;
            let next = tokio::select! {
                _ = &mut writer_gone => return Teardown::WriterGone,
                next = time::timeout_at(deadline, reader.recv()) => next,
            };

            let frame = match next {
                Err(_) => {
                    warn!(connection = %self.id, "No traffic within liveness window");
                    return Teardown::LivenessTimeout;
                }
                Ok(None) => return Teardown::Closed,
                Ok(Some(Err(e))) => return Teardown::Transport(e),
                Ok(Some(Ok(frame))) => frame,
            };
            last_seen = Instant::now();

            if let Err(e) = codec::check_frame_size(frame.len(), self.config.max_frame_size) {
                warn!(connection = %self.id, error = %e, "Inbound frame too large");
                return Teardown::Oversized(frame.len());
            }

            let text = match frame {
                WireFrame::Text(text) => text,
                WireFrame::Binary(data) => match codec::binary_to_text(data) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(connection = %self.id, error = %e, "Dropping binary frame");
                        continue;
                    }
                },
                WireFrame::Ping(_) | WireFrame::Pong(_) => {
                    trace!(connection = %self.id, "Liveness frame");
                    continue;
                }
                WireFrame::Close => return Teardown::Closed,
            };

            if let Err(HubError::Closed) = self.handle_text(&text).await {
                return Teardown::HubGone;
            }
        }
    }

    async fn handle_text(&self, text: &str) -> Result<(), HubError> {
        let inbound = match codec::decode_inbound(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(connection = %self.id, username = %self.username, error = %e, "Dropping malformed message");
                return Ok(());
            }
        };

        let Some(content) = sanitize_content(&inbound.content, self.config.max_content_length) else {
            debug!(connection = %self.id, username = %self.username, "Empty message content, ignoring");
            return Ok(());
        };
        if content.len() < inbound.content.len() {
            info!(
                connection = %self.id,
                username = %self.username,
                chars = inbound.content.chars().count(),
                max = self.config.max_content_length,
                "Message too long, truncating"
            );
        }

        let event = Event::message(self.username.as_str(), content);
        debug!(connection = %self.id, event = %event.id, "Message received");

        self.persist(&event).await;

        match self.hub.broadcast(event) {
            Ok(()) => Ok(()),
            Err(HubError::Saturated) => {
                warn!(connection = %self.id, username = %self.username, "Broadcast queue full, message dropped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn persist(&self, event: &Event) {
        let Some(store) = &self.store else {
            return;
        };

        let record = StoredEvent::from(event);
        match time::timeout(self.config.persist_timeout, store.append(&record)).await {
            Ok(Ok(())) => trace!(connection = %self.id, event = %event.id, "Message persisted"),
            Ok(Err(e)) => {
                warn!(connection = %self.id, event = %event.id, error = %e, "Failed to persist message");
            }
            Err(_) => warn!(connection = %self.id, event = %event.id, "Persisting message timed out"),
        }
    }
}

async fn write_loop<W: FrameWriter>(
    id: ConnectionId,
    mut writer: W,
    mut queue: OutboundQueue,
    config: PumpConfig,
    _done: oneshot::Sender<()>,
) {
    let mut keepalive = time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            payload = queue.recv() => {
                let Some(payload) = payload else {
                    debug!(connection = %id, "Outbound queue closed");
                    let _ = write_frame(&mut writer, WireFrame::Close, config.write_timeout).await;
                    break;
                };
                if let Err(e) = write_frame(&mut writer, WireFrame::Text(payload.to_string()), config.write_timeout).await {
                    warn!(connection = %id, error = %e, "Write failed");
                    break;
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = write_frame(&mut writer, WireFrame::Ping(Vec::new()), config.write_timeout).await {
                    debug!(connection = %id, error = %e, "Ping failed");
                    break;
                }
            }
        }
    }

    let _ = time::timeout(config.write_timeout, writer.close()).await;
    trace!(connection = %id, "Write side finished");
}

async fn write_frame<W: FrameWriter>(
    writer: &mut W,
    frame: WireFrame,
    deadline: Duration,
) -> Result<(), TransportError> {
    time::timeout(deadline, writer.send(frame))
        .await
        .map_err(|_| TransportError::Timeout)?
}
