//! # netfile-client
//!
//! Client-side request and transaction engine for a network file protocol.
//!
//! The crate builds outgoing protocol messages, multiplexes them over a
//! single connection by correlation id, and reassembles multi-packet
//! transaction replies. Session negotiation and authentication are the
//! caller's business; this crate starts where an established connection
//! ends.
//!
//! ## Architecture
//!
//! - **Protocol layer**: 32-byte envelope encoding, dual status encodings
//!   (legacy class/code and extended unified code), and a message builder
//!   with deferred, must-close count fields.
//! - **Transport worker**: a task owning the stream; callers submit frozen
//!   messages over a channel and await replies demuxed by correlation id.
//! - **Engines**: [`RequestEngine`] for single envelopes with bounded
//!   restart-retry and attach-on-demand, [`TransactionEngine`] for
//!   parameter/data streams split across packets and spliced back together.
//!
//! ## Example
//!
//! ```ignore
//! use netfile_client::{
//!     spawn_transport, Attachment, Chain, Connection, ConnectionConfig,
//!     RequestEngine, Transaction, TransactionEngine, TransportConfig, TxnTarget,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> netfile_client::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("server:445").await?;
//!     let (transport, _worker) = spawn_transport(stream, TransportConfig::default());
//!
//!     let conn = Arc::new(Connection::new(ConnectionConfig::default()));
//!     let attachment = Arc::new(Attachment::new("\\\\server\\share"));
//!     let engine = RequestEngine::new(conn.clone(), attachment, transport);
//!     let txns = TransactionEngine::new(engine);
//!
//!     let mut txn = Transaction::new(&conn, TxnTarget::Named("\\PIPE\\svc".into()))?;
//!     txn.set_params(Chain::from(bytes::Bytes::from_static(b"\x01\x00")));
//!     txns.transact(&mut txn).await?;
//!     let _reply = txn.take_reply_data();
//!     Ok(())
//! }
//! ```

pub mod chain;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod transport;

mod request;
mod transaction;

pub use chain::Chain;
pub use connection::{
    Attachment, Connection, ConnectionConfig, DEFAULT_TX_MAX, RECONNECT_TICK,
};
pub use error::{Error, Result};
pub use pool::{Pool, PoolGuard};
pub use protocol::{
    commands, MessageBuilder, ReplyEnvelope, Status, StatusMode, HEADER_SIZE,
};
pub use request::{Request, RequestEngine, RequestState, MAX_RETRY};
pub use transaction::{Transaction, TransactionEngine, TxnTarget, MAX_SETUP_WORDS};
pub use transport::{
    spawn_transport, PendingReply, Submission, TransportConfig, TransportHandle,
};
