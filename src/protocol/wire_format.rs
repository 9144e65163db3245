//! Fixed message envelope layout and reply parsing.
//!
//! Every message, request or reply, starts with the 32-byte envelope:
//!
//! ```text
//! ┌───────────┬─────────┬─────────┬───────┬────────┬──────────┬─────────┬────────────┬─────────┬────────────────┐
//! │ Signature │ Command │ Status  │ Flags │ Flags2 │ Reserved │ Tree ID │ Process ID │ User ID │ Correlation ID │
//! │ 4 bytes   │ 1 byte  │ 4 bytes │ 1 byte│ 2 bytes│ 12 bytes │ 2 bytes │ 2 bytes    │ 2 bytes │ 2 bytes        │
//! └───────────┴─────────┴─────────┴───────┴────────┴──────────┴─────────┴────────────┴─────────┴────────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. The status field is either one
//! 4-byte unified code (extended mode) or class:1 + reserved:1 + code:2
//! (legacy mode); both occupy the same 4 bytes.

use bytes::Buf;

use crate::error::{Error, Result};
use crate::protocol::status::{Status, StatusMode};

/// Envelope size in bytes (fixed, exactly 32).
pub const HEADER_SIZE: usize = 32;

/// Message signature: 0xFF followed by "NFP".
pub const SIGNATURE: [u8; 4] = [0xFF, b'N', b'F', b'P'];

/// Byte offset of the status field within the envelope.
pub const STATUS_OFFSET: usize = 5;

/// Byte offset of the tree-id field within the envelope.
pub const TREE_ID_OFFSET: usize = 24;

/// Byte offset of the correlation-id field within the envelope.
pub const CORRELATION_ID_OFFSET: usize = 30;

/// Flags2 bit: replies carry a 4-byte unified status code.
pub const FLAGS2_EXTENDED_STATUS: u16 = 0x4000;

/// Command codes used by the engine itself.
///
/// Command-specific payload semantics live with the callers; the engine only
/// needs the codes for the operations it issues on its own behalf.
pub mod commands {
    /// Multi-packet transaction addressed by name, primary packet.
    pub const TRANSACTION: u8 = 0x25;
    /// Secondary packet of a named transaction.
    pub const TRANSACTION_SECONDARY: u8 = 0x26;
    /// Multi-packet transaction addressed by file id, primary packet.
    pub const TRANSACTION_TYPED: u8 = 0x32;
    /// Secondary packet of a typed transaction.
    pub const TRANSACTION_TYPED_SECONDARY: u8 = 0x33;
    /// Attach to a share (tree connect), issued internally on demand.
    pub const TREE_CONNECT: u8 = 0x75;
}

/// Parsed reply envelope fields.
///
/// Populated by [`parse_envelope`]; carries no command-specific body data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub status: Status,
    pub tree_id: u16,
    pub process_id: u16,
    pub user_id: u16,
    pub correlation_id: u16,
}

/// Parse the fixed reply envelope, leaving the cursor at the start of the
/// command-specific body.
///
/// The signature and command bytes are skipped unchecked (the transport
/// worker already framed the message); the status field is decoded according
/// to the connection's negotiated mode. No side effects beyond the returned
/// tuple.
pub fn parse_envelope(buf: &mut impl Buf, mode: StatusMode) -> Result<ReplyEnvelope> {
    if buf.remaining() < HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "reply too short for envelope: {} bytes",
            buf.remaining()
        )));
    }

    buf.advance(4); // signature
    buf.advance(1); // command

    let status = match mode {
        StatusMode::Extended => Status(buf.get_u32_le()),
        StatusMode::Legacy => {
            let class = buf.get_u8();
            buf.advance(1);
            let code = buf.get_u16_le();
            Status::from_legacy(class, code)
        }
    };

    buf.advance(1); // flags (ignored)
    buf.advance(2); // flags2 (ignored)
    buf.advance(12); // reserved

    Ok(ReplyEnvelope {
        status,
        tree_id: buf.get_u16_le(),
        process_id: buf.get_u16_le(),
        user_id: buf.get_u16_le(),
        correlation_id: buf.get_u16_le(),
    })
}

/// Read the correlation id out of a raw message without consuming it.
///
/// Returns `None` for messages shorter than the envelope. The transport
/// worker demultiplexes replies with this.
pub fn peek_correlation_id(message: &[u8]) -> Option<u16> {
    if message.len() < HEADER_SIZE {
        return None;
    }
    Some(u16::from_le_bytes([
        message[CORRELATION_ID_OFFSET],
        message[CORRELATION_ID_OFFSET + 1],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// Build a raw reply envelope with the given fields.
    fn make_envelope(status: [u8; 4], tid: u16, pid: u16, uid: u16, mid: u16) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(&SIGNATURE);
        buf.push(0x42); // command
        buf.extend_from_slice(&status);
        buf.push(0); // flags
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags2
        buf.extend_from_slice(&[0u8; 12]);
        buf.extend_from_slice(&tid.to_le_bytes());
        buf.extend_from_slice(&pid.to_le_bytes());
        buf.extend_from_slice(&uid.to_le_bytes());
        buf.extend_from_slice(&mid.to_le_bytes());
        buf
    }

    #[test]
    fn test_parse_extended_status() {
        let raw = make_envelope(0xC000_0022u32.to_le_bytes(), 7, 11, 13, 99);
        let mut buf = Bytes::from(raw);
        let env = parse_envelope(&mut buf, StatusMode::Extended).unwrap();

        assert_eq!(env.status, Status::ACCESS_DENIED);
        assert_eq!(env.tree_id, 7);
        assert_eq!(env.process_id, 11);
        assert_eq!(env.user_id, 13);
        assert_eq!(env.correlation_id, 99);
    }

    #[test]
    fn test_parse_legacy_status_mapped() {
        // class DOS (1), reserved, code 5 -> ACCESS_DENIED
        let raw = make_envelope([1, 0, 5, 0], 1, 2, 3, 4);
        let mut buf = Bytes::from(raw);
        let env = parse_envelope(&mut buf, StatusMode::Legacy).unwrap();
        assert_eq!(env.status, Status::ACCESS_DENIED);
    }

    #[test]
    fn test_parse_leaves_cursor_at_body() {
        let mut raw = make_envelope([0; 4], 0, 0, 0, 1);
        raw.extend_from_slice(b"body");
        let mut buf = Bytes::from(raw);
        let _ = parse_envelope(&mut buf, StatusMode::Extended).unwrap();
        assert_eq!(&buf[..], b"body");
    }

    #[test]
    fn test_parse_too_short_rejected() {
        let mut buf = Bytes::from(vec![0u8; HEADER_SIZE - 1]);
        let err = parse_envelope(&mut buf, StatusMode::Extended).unwrap_err();
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn test_peek_correlation_id() {
        let raw = make_envelope([0; 4], 0, 0, 0, 0xBEEF);
        assert_eq!(peek_correlation_id(&raw), Some(0xBEEF));
        assert_eq!(peek_correlation_id(&raw[..HEADER_SIZE - 1]), None);
    }
}
