//! Single-envelope requests and the dispatch engine.
//!
//! A [`Request`] owns one outgoing envelope under construction plus the
//! bookkeeping that survives it: send state, restart flags, the reply
//! envelope, and an optional completion callback behind its own lock.
//!
//! [`RequestEngine`] drives the lifecycle: `submit` hands the message to the
//! transport worker (parking while the attachment is reconnecting and
//! attaching on demand first), `send_and_wait` adds the reply wait, and
//! `simple` wraps the whole exchange in the bounded restart-retry loop.

use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::connection::{Attachment, Connection};
use crate::error::{Error, Result};
use crate::pool::PoolGuard;
use crate::protocol::{
    commands, parse_envelope, MessageBuilder, ReplyEnvelope, Status, CORRELATION_ID_OFFSET,
    TREE_ID_OFFSET,
};
use crate::transport::{PendingReply, TransportHandle};

/// Maximum attempts for the bounded retry loops (`simple` and the
/// transaction outer loop).
pub const MAX_RETRY: usize = 3;

/// Completion callback invoked with the reply envelope.
pub type Completion = Box<dyn FnOnce(&ReplyEnvelope) + Send + 'static>;

/// Request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    NotSent,
    Sent,
    Done,
    Failed,
}

// Request flags.
const FLAG_RESTART: u8 = 0x01; // transport signaled a safe restart point
const FLAG_RESTART_DENIED: u8 = 0x02;
const FLAG_MULTI_PACKET: u8 = 0x04;
const FLAG_FROM_POOL: u8 = 0x08;
const FLAG_INTERNAL: u8 = 0x10; // issued on behalf of the transport path itself

/// One protocol request: envelope under construction plus reply bookkeeping.
pub struct Request {
    conn: Arc<Connection>,
    command: u8,
    correlation_id: u16,
    builder: MessageBuilder,
    state: RequestState,
    flags: u8,
    /// Snapshot of the assembled message, keyed by the tree id it was
    /// patched with; invalidated when the body or tree id changes.
    frozen: Option<(u16, Bytes)>,
    pending: Option<PendingReply>,
    reply: Option<ReplyEnvelope>,
    body: Option<Bytes>,
    /// (callback, argument) pair; its lock is independent of any
    /// connection or attachment lock.
    completion: Mutex<Option<Completion>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .field("correlation_id", &self.correlation_id)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Request {
    /// Create a request and write its envelope.
    pub fn new(conn: &Arc<Connection>, command: u8) -> Result<Self> {
        Self::build(conn, command, MessageBuilder::bound(Arc::clone(conn)), 0)
    }

    /// Create a request backed by a pooled scratch buffer.
    pub fn with_scratch(
        conn: &Arc<Connection>,
        command: u8,
        scratch: PoolGuard<BytesMut>,
    ) -> Result<Self> {
        Self::build(
            conn,
            command,
            MessageBuilder::bound_with(Arc::clone(conn), scratch),
            FLAG_FROM_POOL,
        )
    }

    fn build(
        conn: &Arc<Connection>,
        command: u8,
        mut builder: MessageBuilder,
        flags: u8,
    ) -> Result<Self> {
        let correlation_id = builder.start(command)?;
        Ok(Self {
            conn: Arc::clone(conn),
            command,
            correlation_id,
            builder,
            state: RequestState::NotSent,
            flags,
            frozen: None,
            pending: None,
            reply: None,
            body: None,
            completion: Mutex::new(None),
        })
    }

    #[inline]
    pub fn command(&self) -> u8 {
        self.command
    }

    #[inline]
    pub fn correlation_id(&self) -> u16 {
        self.correlation_id
    }

    #[inline]
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Access the envelope builder to append command-specific body bytes.
    pub fn builder_mut(&mut self) -> &mut MessageBuilder {
        self.frozen = None;
        &mut self.builder
    }

    /// Reply envelope fields, populated after receipt.
    pub fn reply(&self) -> Option<&ReplyEnvelope> {
        self.reply.as_ref()
    }

    /// Command-specific reply body, populated after a successful exchange.
    pub fn take_body(&mut self) -> Option<Bytes> {
        self.body.take()
    }

    /// Mark this request as issued directly on behalf of the transport
    /// path; it bypasses the reconnect wait and attach-on-demand.
    pub fn mark_internal(&mut self) {
        self.flags |= FLAG_INTERNAL;
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        self.flags & FLAG_INTERNAL != 0
    }

    /// Forbid the retry loops from re-attempting this request even when the
    /// transport signals a restart.
    pub fn deny_restart(&mut self) {
        self.flags |= FLAG_RESTART_DENIED;
    }

    #[inline]
    pub fn restart_denied(&self) -> bool {
        self.flags & FLAG_RESTART_DENIED != 0
    }

    #[inline]
    pub fn restart_signaled(&self) -> bool {
        self.flags & FLAG_RESTART != 0
    }

    pub(crate) fn mark_multi_packet(&mut self) {
        self.flags |= FLAG_MULTI_PACKET;
    }

    #[inline]
    pub fn is_multi_packet(&self) -> bool {
        self.flags & FLAG_MULTI_PACKET != 0
    }

    #[inline]
    pub fn is_from_pool(&self) -> bool {
        self.flags & FLAG_FROM_POOL != 0
    }

    /// Store a completion callback; invoked once with the reply envelope
    /// when the exchange succeeds.
    pub fn set_callback(&self, callback: impl FnOnce(&ReplyEnvelope) + Send + 'static) {
        let mut slot = match self.completion.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Box::new(callback));
    }

    /// Overwrite the correlation id (transaction secondaries reuse the
    /// primary's id so replies match).
    pub(crate) fn set_correlation_id(&mut self, correlation_id: u16) -> Result<()> {
        self.builder
            .patch_u16(CORRELATION_ID_OFFSET, correlation_id)?;
        self.correlation_id = correlation_id;
        self.frozen = None;
        Ok(())
    }

    /// Snapshot the assembled message with the current tree id patched in.
    ///
    /// The snapshot is cached; rebuilding only happens when the body or
    /// tree id changed since the last freeze.
    pub(crate) fn freeze(&mut self) -> Result<Bytes> {
        let tree_id = self.conn.tree_id();
        if let Some((frozen_tid, bytes)) = &self.frozen {
            if *frozen_tid == tree_id {
                return Ok(bytes.clone());
            }
        }
        self.builder.patch_u16(TREE_ID_OFFSET, tree_id)?;
        let bytes = self.builder.snapshot();
        self.frozen = Some((tree_id, bytes.clone()));
        Ok(bytes)
    }

    /// Reset per-attempt state: clear the restart flag and go back to
    /// NotSent. The envelope is left as built.
    pub(crate) fn reset(&mut self) {
        self.flags &= !FLAG_RESTART;
        self.state = RequestState::NotSent;
        self.pending = None;
        self.reply = None;
        self.body = None;
    }

    /// Drop the command-specific body, keeping the envelope. Transactions
    /// rebuild their primary body on restart.
    pub(crate) fn reset_body(&mut self) {
        self.builder.truncate(crate::protocol::HEADER_SIZE);
        self.frozen = None;
    }

    pub(crate) fn set_pending(&mut self, pending: PendingReply) {
        self.pending = Some(pending);
        self.state = RequestState::Sent;
    }

    pub(crate) fn pending_mut(&mut self) -> Option<&mut PendingReply> {
        self.pending.as_mut()
    }

    pub(crate) fn record_reply(&mut self, envelope: ReplyEnvelope) {
        self.reply = Some(envelope);
    }

    /// Mark the exchange complete and fire the completion callback.
    pub(crate) fn complete(&mut self, envelope: ReplyEnvelope, body: Bytes) {
        self.reply = Some(envelope);
        self.body = Some(body);
        self.state = RequestState::Done;

        let callback = {
            let mut slot = match self.completion.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.take()
        };
        if let Some(callback) = callback {
            callback(&envelope);
        }
    }

    pub(crate) fn fail(&mut self, restart_signaled: bool) {
        self.state = RequestState::Failed;
        if restart_signaled {
            self.flags |= FLAG_RESTART;
        }
    }
}

/// Dispatches single envelopes with bounded retry.
#[derive(Debug, Clone)]
pub struct RequestEngine {
    conn: Arc<Connection>,
    attachment: Arc<Attachment>,
    transport: TransportHandle,
}

impl RequestEngine {
    pub fn new(conn: Arc<Connection>, attachment: Arc<Attachment>, transport: TransportHandle) -> Self {
        Self {
            conn,
            attachment,
            transport,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn attachment(&self) -> &Arc<Attachment> {
        &self.attachment
    }

    pub(crate) fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Create a request bound to this engine's connection.
    pub fn new_request(&self, command: u8) -> Result<Request> {
        Request::new(&self.conn, command)
    }

    /// Hand a request to the transport worker.
    ///
    /// Internal requests go straight through. Everyone else first waits for
    /// the attachment's reconnecting flag to clear, then attaches on demand;
    /// when the attach reports a moved target the submission is retried
    /// after re-checking the flag.
    pub async fn submit(&self, rq: &mut Request) -> Result<()> {
        if rq.is_internal() {
            return self.raw_submit(rq).await;
        }

        self.attachment.wait_ready().await;
        if !self.attachment.is_attached() {
            match Box::pin(self.attach()).await {
                Ok(true) => self.attachment.wait_ready().await,
                Ok(false) => {}
                Err(e) => {
                    rq.fail(e.is_restartable());
                    return Err(e);
                }
            }
        }
        self.raw_submit(rq).await
    }

    async fn raw_submit(&self, rq: &mut Request) -> Result<()> {
        let message = match rq.freeze() {
            Ok(message) => message,
            Err(e) => {
                rq.fail(false);
                return Err(e);
            }
        };
        match self.transport.submit(rq.correlation_id(), message).await {
            Ok(pending) => {
                rq.set_pending(pending);
                Ok(())
            }
            Err(e) => {
                rq.fail(e.is_restartable());
                Err(e)
            }
        }
    }

    /// Submit and wait for the reply, storing envelope and body on success.
    pub async fn send_and_wait(&self, rq: &mut Request) -> Result<()> {
        self.submit(rq).await?;
        let (envelope, _raw, body) = self.next_reply(rq).await?;
        rq.complete(envelope, body);
        Ok(())
    }

    /// Wait for the next reply on an already-submitted request.
    ///
    /// Returns the parsed envelope, the raw message (fragment offsets are
    /// relative to its start), and the cursor positioned at the body.
    pub(crate) async fn next_reply(
        &self,
        rq: &mut Request,
    ) -> Result<(ReplyEnvelope, Bytes, Bytes)> {
        let pending = rq
            .pending_mut()
            .ok_or_else(|| Error::Config("request was not submitted".into()))?;

        let raw = match pending.recv().await {
            Ok(raw) => raw,
            Err(e) => {
                rq.fail(e.is_restartable());
                return Err(e);
            }
        };

        let mut cursor = raw.clone();
        let envelope = match parse_envelope(&mut cursor, self.conn.status_mode()) {
            Ok(envelope) => envelope,
            Err(e) => {
                rq.fail(false);
                return Err(e);
            }
        };
        debug_assert_eq!(envelope.correlation_id, rq.correlation_id());

        if envelope.status.is_error() {
            rq.record_reply(envelope);
            rq.fail(false);
            return Err(Error::Server(envelope.status));
        }

        Ok((envelope, raw, cursor))
    }

    /// One complete exchange with bounded restart-retry.
    ///
    /// Attempts up to [`MAX_RETRY`] times; re-attempts only when the
    /// transport signaled a restart and the request permits it. The last
    /// observed error is returned when attempts run out.
    pub async fn simple(&self, rq: &mut Request) -> Result<()> {
        let mut attempts = 0;
        loop {
            rq.reset();
            match self.send_and_wait(rq).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    let restart = rq.restart_signaled() && !rq.restart_denied();
                    if !restart || attempts >= MAX_RETRY {
                        if restart {
                            tracing::warn!(
                                command = rq.command(),
                                attempts,
                                "request retries exhausted"
                            );
                        }
                        return Err(e);
                    }
                    tracing::debug!(
                        command = rq.command(),
                        attempt = attempts,
                        "transport signaled restart, re-attempting"
                    );
                }
            }
        }
    }

    /// Attach to the share on demand, through this same engine.
    ///
    /// Returns `true` when the server reported the target moved (topology
    /// changed), in which case the caller retries its submission.
    pub(crate) async fn attach(&self) -> Result<bool> {
        let mut rq = Request::new(&self.conn, commands::TREE_CONNECT)?;
        rq.mark_internal();
        {
            let b = rq.builder_mut();
            let words = b.open_word_field();
            b.close_word_field(words)?;
            let bytes = b.open_byte_field();
            b.put_slice(self.attachment.share().as_bytes());
            b.put_u8(0);
            b.close_byte_field(bytes)?;
        }

        match self.simple(&mut rq).await {
            Ok(()) => {
                if let Some(envelope) = rq.reply() {
                    self.conn.set_tree_id(envelope.tree_id);
                }
                self.attachment.set_attached(true);
                Ok(false)
            }
            Err(Error::Server(status)) if status == Status::TOPOLOGY_CHANGED => {
                if let Some(envelope) = rq.reply() {
                    self.conn.set_tree_id(envelope.tree_id);
                }
                self.attachment.set_attached(true);
                tracing::debug!(
                    share = self.attachment.share(),
                    "attach target moved, retrying submission"
                );
                Ok(true)
            }
            Err(Error::Server(status)) if status == Status::ACCESS_DENIED => Err(Error::Access(
                format!("attach to {} denied", self.attachment.share()),
            )),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::protocol::{peek_correlation_id, HEADER_SIZE, SIGNATURE};
    use crate::transport::{Submission, TransportConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn test_engine() -> (RequestEngine, mpsc::Receiver<Submission>) {
        let conn = Arc::new(Connection::new(ConnectionConfig::default()));
        let attachment = Arc::new(Attachment::new("\\\\srv\\share"));
        attachment.set_attached(true);
        let (transport, rx) = TransportHandle::channel(&TransportConfig::default());
        (RequestEngine::new(conn, attachment, transport), rx)
    }

    /// Build a legacy-mode success reply for the given correlation id.
    fn reply_bytes(correlation_id: u16, tree_id: u16, body: &[u8]) -> Bytes {
        let mut msg = Vec::with_capacity(HEADER_SIZE + body.len());
        msg.extend_from_slice(&SIGNATURE);
        msg.push(0);
        msg.extend_from_slice(&[0u8; 4]); // status: success
        msg.push(0);
        msg.extend_from_slice(&[0u8; 2]);
        msg.extend_from_slice(&[0u8; 12]);
        msg.extend_from_slice(&tree_id.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&correlation_id.to_le_bytes());
        msg.extend_from_slice(body);
        Bytes::from(msg)
    }

    /// Responder that answers every submission with a success reply.
    fn spawn_echo_responder(mut rx: mpsc::Receiver<Submission>) {
        tokio::spawn(async move {
            while let Some(sub) = rx.recv().await {
                if let Some(replies) = sub.replies {
                    let mid = peek_correlation_id(&sub.message).expect("envelope");
                    let _ = replies.send(Ok(reply_bytes(mid, 1, b"pong"))).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn test_simple_success_round_trip() {
        let (engine, rx) = test_engine();
        spawn_echo_responder(rx);

        let mut rq = engine.new_request(0x42).unwrap();
        engine.simple(&mut rq).await.unwrap();

        assert_eq!(rq.state(), RequestState::Done);
        assert_eq!(rq.reply().unwrap().tree_id, 1);
        assert_eq!(&rq.take_body().unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn test_completion_callback_fires_once() {
        let (engine, rx) = test_engine();
        spawn_echo_responder(rx);

        let fired = Arc::new(AtomicUsize::new(0));
        let mut rq = engine.new_request(0x42).unwrap();
        let counter = Arc::clone(&fired);
        rq.set_callback(move |envelope| {
            assert!(envelope.status.is_success());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        engine.simple(&mut rq).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restartable_error_retries_exactly_max_retry() {
        let (engine, mut rx) = test_engine();
        let served = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&served);
        tokio::spawn(async move {
            while let Some(sub) = rx.recv().await {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(replies) = sub.replies {
                    let _ = replies
                        .send(Err(Error::TransportRestartable("reset".into())))
                        .await;
                }
            }
        });

        let mut rq = engine.new_request(0x42).unwrap();
        let err = engine.simple(&mut rq).await.unwrap_err();

        assert!(err.is_restartable());
        assert_eq!(rq.state(), RequestState::Failed);
        assert_eq!(served.load(Ordering::SeqCst), MAX_RETRY);
    }

    #[tokio::test]
    async fn test_non_restartable_error_stops_after_one_attempt() {
        let (engine, mut rx) = test_engine();
        let served = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&served);
        tokio::spawn(async move {
            while let Some(sub) = rx.recv().await {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(replies) = sub.replies {
                    let _ = replies.send(Err(Error::Transport("broken".into()))).await;
                }
            }
        });

        let mut rq = engine.new_request(0x42).unwrap();
        let err = engine.simple(&mut rq).await.unwrap_err();

        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_denied_stops_after_one_attempt() {
        let (engine, mut rx) = test_engine();
        let served = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&served);
        tokio::spawn(async move {
            while let Some(sub) = rx.recv().await {
                count.fetch_add(1, Ordering::SeqCst);
                if let Some(replies) = sub.replies {
                    let _ = replies
                        .send(Err(Error::TransportRestartable("reset".into())))
                        .await;
                }
            }
        });

        let mut rq = engine.new_request(0x42).unwrap();
        rq.deny_restart();
        let err = engine.simple(&mut rq).await.unwrap_err();

        assert!(err.is_restartable());
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_status_surfaces() {
        let (engine, mut rx) = test_engine();
        tokio::spawn(async move {
            while let Some(sub) = rx.recv().await {
                if let Some(replies) = sub.replies {
                    let mid = peek_correlation_id(&sub.message).expect("envelope");
                    // Legacy class DOS, code 5 -> ACCESS_DENIED.
                    let mut raw = reply_bytes(mid, 0, b"").to_vec();
                    raw[5] = crate::protocol::class::DOS;
                    raw[7..9].copy_from_slice(&5u16.to_le_bytes());
                    let _ = replies.send(Ok(Bytes::from(raw))).await;
                }
            }
        });

        let mut rq = engine.new_request(0x42).unwrap();
        let err = engine.simple(&mut rq).await.unwrap_err();
        assert!(matches!(err, Error::Server(s) if s == Status::ACCESS_DENIED));
        assert_eq!(rq.state(), RequestState::Failed);
    }

    #[tokio::test]
    async fn test_attach_on_demand_precedes_first_request() {
        let (engine, mut rx) = test_engine();
        engine.attachment().set_attached(false);

        let commands_seen = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&commands_seen);
        tokio::spawn(async move {
            while let Some(sub) = rx.recv().await {
                seen.lock().unwrap().push(sub.message[4]);
                if let Some(replies) = sub.replies {
                    let mid = peek_correlation_id(&sub.message).expect("envelope");
                    let _ = replies.send(Ok(reply_bytes(mid, 7, b""))).await;
                }
            }
        });

        let mut rq = engine.new_request(0x42).unwrap();
        engine.send_and_wait(&mut rq).await.unwrap();

        let seen = commands_seen.lock().unwrap().clone();
        assert_eq!(seen, vec![commands::TREE_CONNECT, 0x42]);
        assert_eq!(engine.connection().tree_id(), 7);
        assert!(engine.attachment().is_attached());
    }

    #[tokio::test]
    async fn test_internal_request_bypasses_reconnect_wait() {
        let (engine, rx) = test_engine();
        engine.attachment().set_reconnecting(true);
        spawn_echo_responder(rx);

        let mut rq = engine.new_request(0x42).unwrap();
        rq.mark_internal();
        // Would park forever if the internal flag were ignored.
        tokio::time::timeout(std::time::Duration::from_secs(1), engine.simple(&mut rq))
            .await
            .expect("internal request must not wait for reconnect")
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_submit_marks_request_failed() {
        let (engine, rx) = test_engine();
        // No worker behind the channel: the submission cannot be accepted.
        drop(rx);

        let mut rq = engine.new_request(0x42).unwrap();
        let err = engine.submit(&mut rq).await.unwrap_err();

        assert!(matches!(err, Error::ConnectionClosed));
        assert_eq!(rq.state(), RequestState::Failed);
    }

    #[tokio::test]
    async fn test_frozen_message_carries_current_tree_id() {
        let (engine, rx) = test_engine();
        spawn_echo_responder(rx);
        engine.connection().set_tree_id(0x0A0B);

        let mut rq = engine.new_request(0x42).unwrap();
        let message = rq.freeze().unwrap();
        assert_eq!(
            u16::from_le_bytes([message[TREE_ID_OFFSET], message[TREE_ID_OFFSET + 1]]),
            0x0A0B
        );
    }
}
