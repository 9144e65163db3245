//! Outgoing message assembly with deferred-length fields.
//!
//! [`MessageBuilder`] writes the fixed envelope and lets command code append
//! the body. Length fields whose value is only known after the intervening
//! bytes are written are modeled as must-consume handles rather than raw
//! offsets to patch: [`open_word_field`] reserves the
//! field and returns a [`WordCountField`] that can only be closed once, and
//! closing fails loudly if the span violates the field's width.
//!
//! [`open_word_field`]: MessageBuilder::open_word_field

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pool::PoolGuard;
use crate::protocol::wire_format::{FLAGS2_EXTENDED_STATUS, HEADER_SIZE, SIGNATURE};
use crate::protocol::StatusMode;

/// Handle for a reserved 1-byte word-count field.
///
/// Close patches `(bytes written since open) / 2`; an odd span is an error.
#[must_use = "an opened word-count field must be closed before send"]
#[derive(Debug)]
pub struct WordCountField {
    offset: usize,
}

/// Handle for a reserved 2-byte byte-count field.
///
/// Close patches the byte span; a span over 65535 is an error.
#[must_use = "an opened byte-count field must be closed before send"]
#[derive(Debug)]
pub struct ByteCountField {
    offset: usize,
}

/// Backing buffer: freshly owned or checked out of a scratch pool.
#[derive(Debug)]
enum Scratch {
    Owned(BytesMut),
    Pooled(PoolGuard<BytesMut>),
}

impl Scratch {
    fn buf(&mut self) -> &mut BytesMut {
        match self {
            Scratch::Owned(b) => b,
            Scratch::Pooled(g) => g,
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Scratch::Owned(b) => b,
            Scratch::Pooled(g) => g,
        }
    }
}

/// Assembles one outgoing envelope (header + body).
#[derive(Debug)]
pub struct MessageBuilder {
    conn: Option<Arc<Connection>>,
    buf: Scratch,
}

impl MessageBuilder {
    /// Create a builder with no connection bound.
    ///
    /// [`start`](Self::start) will fail until [`bind`](Self::bind) is called.
    pub fn new() -> Self {
        Self {
            conn: None,
            buf: Scratch::Owned(BytesMut::with_capacity(256)),
        }
    }

    /// Create a builder bound to a connection.
    pub fn bound(conn: Arc<Connection>) -> Self {
        Self {
            conn: Some(conn),
            buf: Scratch::Owned(BytesMut::with_capacity(256)),
        }
    }

    /// Create a bound builder backed by a pooled scratch buffer.
    pub fn bound_with(conn: Arc<Connection>, mut scratch: PoolGuard<BytesMut>) -> Self {
        scratch.clear();
        Self {
            conn: Some(conn),
            buf: Scratch::Pooled(scratch),
        }
    }

    /// Bind a connection after the fact.
    pub fn bind(&mut self, conn: Arc<Connection>) {
        self.conn = Some(conn);
    }

    /// Write the fixed envelope for `command` and return the correlation id
    /// drawn from the connection.
    ///
    /// Status and tree-id fields are placeholders; the tree id is patched at
    /// submit time once the attachment is settled.
    pub fn start(&mut self, command: u8) -> Result<u16> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| Error::Config("message builder is not bound to a connection".into()))?
            .clone();

        let correlation_id = conn.next_correlation_id();
        let mut flags2 = 0u16;
        if conn.status_mode() == StatusMode::Extended {
            flags2 |= FLAGS2_EXTENDED_STATUS;
        }

        let buf = self.buf.buf();
        buf.clear();
        buf.put_slice(&SIGNATURE);
        buf.put_u8(command);
        buf.put_u32_le(0); // status placeholder
        buf.put_u8(0); // flags
        buf.put_u16_le(flags2);
        buf.put_bytes(0, 12); // reserved
        buf.put_u16_le(0); // tree id placeholder
        buf.put_u16_le(conn.process_id());
        buf.put_u16_le(conn.user_id());
        buf.put_u16_le(correlation_id);
        debug_assert_eq!(buf.len(), HEADER_SIZE);

        Ok(correlation_id)
    }

    /// Reserve the 1-byte word-count field.
    pub fn open_word_field(&mut self) -> WordCountField {
        let offset = self.len();
        self.buf.buf().put_u8(0);
        WordCountField { offset }
    }

    /// Close a word-count field, patching the word count of the span written
    /// since open. Fails if the span is odd or exceeds the 1-byte width.
    pub fn close_word_field(&mut self, field: WordCountField) -> Result<()> {
        let span = self.len() - (field.offset + 1);
        if span % 2 != 0 {
            return Err(Error::Config(format!(
                "word-count field spans {} bytes, which is not even",
                span
            )));
        }
        let words = span / 2;
        if words > u8::MAX as usize {
            return Err(Error::Config(format!(
                "word-count field spans {} words, exceeding the 1-byte width",
                words
            )));
        }
        self.buf.buf()[field.offset] = words as u8;
        Ok(())
    }

    /// Reserve the 2-byte byte-count field.
    pub fn open_byte_field(&mut self) -> ByteCountField {
        let offset = self.len();
        self.buf.buf().put_u16_le(0);
        ByteCountField { offset }
    }

    /// Close a byte-count field, patching the byte span written since open.
    /// Fails if the span exceeds 16 bits; no silent truncation.
    pub fn close_byte_field(&mut self, field: ByteCountField) -> Result<()> {
        let span = self.len() - (field.offset + 2);
        if span > u16::MAX as usize {
            return Err(Error::Config(format!(
                "byte-count field spans {} bytes, exceeding the 2-byte width",
                span
            )));
        }
        self.patch_u16(field.offset, span as u16)
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.buf().put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.buf().put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.buf().put_u32_le(v);
    }

    pub fn put_slice(&mut self, v: &[u8]) {
        self.buf.buf().put_slice(v);
    }

    /// Zero-pad until the message is `offset` bytes long.
    ///
    /// Used to place transaction param/data regions at their pre-computed
    /// 4-byte-aligned offsets; a no-op if the message is already there.
    pub fn pad_to(&mut self, offset: usize) {
        let len = self.len();
        debug_assert!(offset >= len, "pad_to would shrink the message");
        if offset > len {
            self.buf.buf().put_bytes(0, offset - len);
        }
    }

    /// Patch a little-endian u16 at an absolute message offset.
    pub fn patch_u16(&mut self, offset: usize, v: u16) -> Result<()> {
        let buf = self.buf.buf();
        if offset + 2 > buf.len() {
            return Err(Error::Config(format!(
                "patch offset {} beyond message length {}",
                offset,
                buf.len()
            )));
        }
        buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// Current message length in bytes.
    pub fn len(&self) -> usize {
        self.buf.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.as_slice().is_empty()
    }

    /// View of the bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Drop everything after `len` bytes. Used to rebuild a transaction body
    /// on restart while keeping the envelope.
    pub fn truncate(&mut self, len: usize) {
        self.buf.buf().truncate(len);
    }

    /// Copy the assembled message out, leaving the builder intact for a
    /// possible rebuild on restart.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(self.buf.as_slice())
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}
