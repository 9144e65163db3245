//! Connection and attachment contexts.
//!
//! A [`Connection`] carries the per-session negotiated parameters the engine
//! reads on every send: the correlation-id generator, the maximum message
//! size, and the status-encoding mode. An [`Attachment`] is a bound resource
//! within the connection (a mounted share) that may transiently require
//! re-establishment; its reconnecting flag is shared by every caller bound
//! to it and guarded by its own lock, distinct from any per-request lock.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::protocol::StatusMode;

/// Default negotiated maximum message size.
pub const DEFAULT_TX_MAX: usize = 4096;

/// Granularity of the reconnecting-flag wait.
pub const RECONNECT_TICK: Duration = Duration::from_millis(10);

/// Configuration for a connection context.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Negotiated maximum size of one physical message, envelope included.
    pub tx_max: usize,
    /// Status encoding the server negotiated.
    pub status_mode: StatusMode,
    /// Process id stamped into every envelope.
    pub process_id: u16,
    /// User id stamped into every envelope.
    pub user_id: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tx_max: DEFAULT_TX_MAX,
            status_mode: StatusMode::Legacy,
            process_id: std::process::id() as u16,
            user_id: 0,
        }
    }
}

/// Per-connection context, shared by every request bound to it.
#[derive(Debug)]
pub struct Connection {
    next_correlation_id: AtomicU16,
    tx_max: usize,
    status_mode: StatusMode,
    process_id: u16,
    user_id: u16,
    tree_id: AtomicU16,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            next_correlation_id: AtomicU16::new(1),
            tx_max: config.tx_max,
            status_mode: config.status_mode,
            process_id: config.process_id,
            user_id: config.user_id,
            tree_id: AtomicU16::new(0),
        }
    }

    /// Draw the next correlation id. Wraps; uniqueness among in-flight
    /// requests is the caller population's concern, as usual for 16-bit ids.
    pub fn next_correlation_id(&self) -> u16 {
        self.next_correlation_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Negotiated maximum message size, envelope included.
    #[inline]
    pub fn tx_max(&self) -> usize {
        self.tx_max
    }

    #[inline]
    pub fn status_mode(&self) -> StatusMode {
        self.status_mode
    }

    #[inline]
    pub fn process_id(&self) -> u16 {
        self.process_id
    }

    #[inline]
    pub fn user_id(&self) -> u16 {
        self.user_id
    }

    /// Tree id of the currently attached share; 0 while unattached.
    pub fn tree_id(&self) -> u16 {
        self.tree_id.load(Ordering::Acquire)
    }

    pub fn set_tree_id(&self, tree_id: u16) {
        self.tree_id.store(tree_id, Ordering::Release);
    }
}

#[derive(Debug, Default)]
struct AttachState {
    attached: bool,
    reconnecting: bool,
}

/// A bound share within a connection.
#[derive(Debug)]
pub struct Attachment {
    share: String,
    state: Mutex<AttachState>,
}

impl Attachment {
    /// Create an attachment for the given share name, initially unattached.
    pub fn new(share: impl Into<String>) -> Self {
        Self {
            share: share.into(),
            state: Mutex::new(AttachState::default()),
        }
    }

    /// Share name sent in the attach request body.
    pub fn share(&self) -> &str {
        &self.share
    }

    pub fn is_reconnecting(&self) -> bool {
        self.lock().reconnecting
    }

    /// Raise or clear the reconnecting flag. While raised, submissions from
    /// non-internal requests park in [`wait_ready`](Self::wait_ready).
    pub fn set_reconnecting(&self, reconnecting: bool) {
        self.lock().reconnecting = reconnecting;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    pub fn set_attached(&self, attached: bool) {
        self.lock().attached = attached;
    }

    /// Wait until the reconnecting flag clears.
    ///
    /// Re-checked at [`RECONNECT_TICK`] granularity rather than spun;
    /// dropping the future is the interrupt.
    pub async fn wait_ready(&self) {
        while self.is_reconnecting() {
            tokio::time::sleep(RECONNECT_TICK).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, AttachState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_correlation_ids_increment() {
        let conn = Connection::new(ConnectionConfig::default());
        let a = conn.next_correlation_id();
        let b = conn.next_correlation_id();
        assert_eq!(b, a.wrapping_add(1));
    }

    #[test]
    fn test_tree_id_round_trip() {
        let conn = Connection::new(ConnectionConfig::default());
        assert_eq!(conn.tree_id(), 0);
        conn.set_tree_id(0x1234);
        assert_eq!(conn.tree_id(), 0x1234);
    }

    #[tokio::test]
    async fn test_wait_ready_passes_when_clear() {
        let att = Attachment::new("share");
        let start = Instant::now();
        att.wait_ready().await;
        assert!(start.elapsed() < RECONNECT_TICK);
    }

    #[tokio::test]
    async fn test_wait_ready_blocks_until_cleared() {
        let att = Arc::new(Attachment::new("share"));
        att.set_reconnecting(true);

        let waiter = {
            let att = Arc::clone(&att);
            tokio::spawn(async move { att.wait_ready().await })
        };

        tokio::time::sleep(RECONNECT_TICK * 3).await;
        assert!(!waiter.is_finished());

        att.set_reconnecting(false);
        tokio::time::timeout(RECONNECT_TICK * 10, waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter task");
    }
}
