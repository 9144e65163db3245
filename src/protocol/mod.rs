//! Protocol module - envelope layout, status mapping, and message assembly.
//!
//! This module implements the generic wire envelope every command rides on:
//! - 32-byte envelope encoding/decoding
//! - dual status encodings (legacy class/code vs. extended unified code)
//! - outgoing message builder with deferred word/byte count fields

mod builder;
mod status;
mod wire_format;

pub use builder::{ByteCountField, MessageBuilder, WordCountField};
pub use status::{class, Status, StatusMode};
pub use wire_format::{
    commands, parse_envelope, peek_correlation_id, ReplyEnvelope, CORRELATION_ID_OFFSET,
    FLAGS2_EXTENDED_STATUS, HEADER_SIZE, SIGNATURE, STATUS_OFFSET, TREE_ID_OFFSET,
};
