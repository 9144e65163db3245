//! Transport module - per-connection worker and message framing.
//!
//! The worker owns the stream; everything above it is synchronous-looking
//! code awaiting on channels.

mod worker;

pub use worker::{
    spawn_transport, MessageFramer, PendingReply, Submission, TransportConfig, TransportHandle,
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REPLY_CAPACITY,
    LENGTH_PREFIX_SIZE,
};
