//! Per-connection transport worker.
//!
//! The worker task owns the socket; callers talk to it through a cheaply
//! cloneable [`TransportHandle`]:
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<Submission> ─► Worker Task ─► Stream
//! Caller N ─┘                                   │
//!            ◄── per-request reply channels ◄───┘ (demuxed by correlation id)
//! ```
//!
//! On the wire each message is preceded by a 4-byte big-endian length prefix.
//! Inbound messages are reassembled by [`MessageFramer`] and routed to the
//! reply channel registered for their correlation id; one request may receive
//! several replies (multi-fragment transactions), so the channel stays
//! registered until its receiver goes away.
//!
//! Losing the stream is the distinguished restartable failure: every pending
//! waiter gets a restartable transport error so the engines' bounded retry
//! loops can re-attempt.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::peek_correlation_id;

/// Length-prefix size on the wire.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum size of a single framed message (128 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 128 * 1024;

/// Default submission channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Default per-request reply channel capacity.
pub const DEFAULT_REPLY_CAPACITY: usize = 32;

/// Configuration for the transport worker.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum framed message size accepted from the peer.
    pub max_message_size: usize,
    /// Submission channel capacity.
    pub channel_capacity: usize,
    /// Reply channel capacity per registered request.
    pub reply_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            reply_capacity: DEFAULT_REPLY_CAPACITY,
        }
    }
}

/// One message handed to the worker for sending.
#[derive(Debug)]
pub struct Submission {
    /// Correlation id replies will carry.
    pub correlation_id: u16,
    /// Complete message, envelope included. The length prefix is added by
    /// the worker.
    pub message: Bytes,
    /// Where to deliver replies; `None` for packets whose replies are
    /// matched to an earlier submission (transaction secondaries).
    pub replies: Option<mpsc::Sender<Result<Bytes>>>,
}

/// Receiving side of a registered request.
#[derive(Debug)]
pub struct PendingReply {
    rx: mpsc::Receiver<Result<Bytes>>,
}

impl PendingReply {
    /// Wait for the next reply message.
    ///
    /// A closed channel means the worker is gone; that surfaces as
    /// [`Error::ConnectionClosed`]. Dropping the future is the interrupt.
    pub async fn recv(&mut self) -> Result<Bytes> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(Error::ConnectionClosed),
        }
    }
}

/// Handle for submitting messages to the worker task.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<Submission>,
    reply_capacity: usize,
}

impl TransportHandle {
    /// Create a handle and the raw submission receiver behind it.
    ///
    /// [`spawn_transport`] wires the receiver to a real stream; tests (or
    /// alternative workers) can drive it directly with a scripted responder.
    pub fn channel(config: &TransportConfig) -> (Self, mpsc::Receiver<Submission>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        (
            Self {
                tx,
                reply_capacity: config.reply_capacity,
            },
            rx,
        )
    }

    /// Submit a message and register for its replies.
    ///
    /// Returns once the worker has accepted the message for sending; this
    /// does not imply a reply yet.
    pub async fn submit(&self, correlation_id: u16, message: Bytes) -> Result<PendingReply> {
        let (reply_tx, reply_rx) = mpsc::channel(self.reply_capacity);
        self.tx
            .send(Submission {
                correlation_id,
                message,
                replies: Some(reply_tx),
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(PendingReply { rx: reply_rx })
    }

    /// Submit a message whose replies are matched to an earlier submission
    /// with the same correlation id.
    pub async fn send(&self, correlation_id: u16, message: Bytes) -> Result<()> {
        self.tx
            .send(Submission {
                correlation_id,
                message,
                replies: None,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// State machine for reassembling length-prefixed messages.
#[derive(Debug)]
enum FramerState {
    /// Waiting for the complete 4-byte length prefix.
    WaitingForLength,
    /// Prefix parsed, waiting for the message body.
    WaitingForBody { length: usize },
}

/// Buffer for accumulating stream reads and extracting complete messages.
#[derive(Debug)]
pub struct MessageFramer {
    buffer: BytesMut,
    state: FramerState,
    max_message_size: usize,
}

impl MessageFramer {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: FramerState::WaitingForLength,
            max_message_size,
        }
    }

    /// Push raw stream bytes and extract all complete messages.
    ///
    /// Partial data is buffered for the next push. A length prefix over the
    /// configured maximum is a protocol error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut messages = Vec::new();
        while let Some(message) = self.try_extract_one()? {
            messages.push(message);
        }
        Ok(messages)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        match self.state {
            FramerState::WaitingForLength => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let length = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]) as usize;
                if length > self.max_message_size {
                    return Err(Error::Protocol(format!(
                        "framed message of {} bytes exceeds maximum {}",
                        length, self.max_message_size
                    )));
                }
                let _ = self.buffer.split_to(LENGTH_PREFIX_SIZE);
                self.state = FramerState::WaitingForBody { length };
                self.try_extract_one()
            }
            FramerState::WaitingForBody { length } => {
                if self.buffer.len() < length {
                    return Ok(None);
                }
                let message = self.buffer.split_to(length).freeze();
                self.state = FramerState::WaitingForLength;
                Ok(Some(message))
            }
        }
    }
}

/// Spawn the transport worker for a connected stream.
///
/// Returns the handle for submitting messages and the worker's join handle.
pub fn spawn_transport<S>(io: S, config: TransportConfig) -> (TransportHandle, JoinHandle<Result<()>>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (handle, rx) = TransportHandle::channel(&config);
    let task = tokio::spawn(transport_loop(io, rx, config));
    (handle, task)
}

/// Main worker loop: writes submissions, reassembles and demuxes replies.
async fn transport_loop<S>(
    io: S,
    mut rx: mpsc::Receiver<Submission>,
    config: TransportConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(io);

    let mut framer = MessageFramer::new(config.max_message_size);
    let mut pending: HashMap<u16, mpsc::Sender<Result<Bytes>>> = HashMap::new();
    let mut rbuf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            submission = rx.recv() => {
                let Some(sub) = submission else {
                    // All handles dropped, clean shutdown.
                    return Ok(());
                };
                // Register before writing so a fast reply cannot race the map.
                if let Some(replies) = sub.replies {
                    pending.insert(sub.correlation_id, replies);
                }
                let prefix = (sub.message.len() as u32).to_be_bytes();
                let wrote = async {
                    writer.write_all(&prefix).await?;
                    writer.write_all(&sub.message).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = wrote {
                    broadcast_failure(&mut pending, "stream write failed");
                    return Err(Error::Io(e));
                }
            }

            read = reader.read(&mut rbuf) => {
                match read {
                    Ok(0) => {
                        broadcast_failure(&mut pending, "connection closed by peer");
                        return Ok(());
                    }
                    Ok(n) => {
                        let messages = match framer.push(&rbuf[..n]) {
                            Ok(m) => m,
                            Err(e) => {
                                // Malformed framing is not restartable.
                                for (_, tx) in pending.drain() {
                                    let _ = tx.try_send(Err(Error::Transport(
                                        "stream framing violated".into(),
                                    )));
                                }
                                return Err(e);
                            }
                        };
                        for message in messages {
                            route_reply(&mut pending, message);
                        }
                    }
                    Err(e) => {
                        broadcast_failure(&mut pending, "stream read failed");
                        return Err(Error::Io(e));
                    }
                }
            }
        }
    }
}

/// Deliver one inbound message to the waiter registered for its
/// correlation id.
fn route_reply(pending: &mut HashMap<u16, mpsc::Sender<Result<Bytes>>>, message: Bytes) {
    let Some(correlation_id) = peek_correlation_id(&message) else {
        tracing::warn!(len = message.len(), "discarding runt message");
        return;
    };

    let Some(tx) = pending.get(&correlation_id) else {
        tracing::debug!(correlation_id, "no waiter for reply, dropping");
        return;
    };
    match tx.try_send(Ok(message)) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!(correlation_id, "reply receiver gone, unregistering");
            pending.remove(&correlation_id);
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            // The waiter would wait forever for the dropped fragment;
            // unregister so it drains the backlog and then sees the
            // channel close as a failure.
            tracing::warn!(correlation_id, "reply channel full, failing the waiter");
            pending.remove(&correlation_id);
        }
    }
}

/// Fail every pending waiter with a restartable transport error.
fn broadcast_failure(pending: &mut HashMap<u16, mpsc::Sender<Result<Bytes>>>, reason: &str) {
    if !pending.is_empty() {
        tracing::debug!(waiters = pending.len(), reason, "failing pending requests");
    }
    for (_, tx) in pending.drain() {
        let _ = tx.try_send(Err(Error::TransportRestartable(reason.to_string())));
    }
}
