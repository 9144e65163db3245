//! Multi-packet transactions: split on send, reassemble on receive.
//!
//! A [`Transaction`] carries logical parameter and data streams that may not
//! fit in a single physical packet. The engine splits them across a primary
//! packet plus as many secondaries as needed (parameters packed before data,
//! offsets 4-byte aligned), then reassembles the server's reply fragments by
//! strict displacement order. The whole exchange is one attempt of the
//! bounded outer retry loop in [`TransactionEngine::transact`].

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::chain::Chain;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::protocol::{commands, MessageBuilder, ReplyEnvelope, HEADER_SIZE};
use crate::request::{Request, RequestEngine, MAX_RETRY};

/// Maximum setup words a transaction may carry.
pub const MAX_SETUP_WORDS: usize = 4;

/// Fixed reply fields preceding the fragment bytes, after the envelope.
const REPLY_FIXED_SIZE: usize = 20;

#[inline]
fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// What the transaction addresses: a named endpoint or an open file handle.
///
/// The choice is made once at construction and decides both the command pair
/// used on the wire and the trailing field of each packet: `Named` sends the
/// NUL-terminated name in the primary and nothing in secondaries, `Typed`
/// sends a single pad byte in the primary and the file id in secondaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnTarget {
    Named(String),
    Typed(u16),
}

impl TxnTarget {
    fn primary_command(&self) -> u8 {
        match self {
            TxnTarget::Named(_) => commands::TRANSACTION,
            TxnTarget::Typed(_) => commands::TRANSACTION_TYPED,
        }
    }

    fn secondary_command(&self) -> u8 {
        match self {
            TxnTarget::Named(_) => commands::TRANSACTION_SECONDARY,
            TxnTarget::Typed(_) => commands::TRANSACTION_TYPED_SECONDARY,
        }
    }
}

/// One transaction: outbound streams, reply limits, and reassembled results.
///
/// Progress carries no explicit state flags. The outbound side is all sent
/// exactly when both remainder chains are empty, which is the send loop's
/// exit condition; the exchange is all received exactly when both running
/// receive counts meet the (possibly shrunk) reported totals, which is the
/// receive loop's exit condition. A failed attempt resets to the initial
/// state through the outer retry in [`TransactionEngine::transact`].
#[derive(Debug)]
pub struct Transaction {
    target: TxnTarget,
    rq: Request,
    setup: Vec<u16>,
    txn_flags: u16,
    timeout: u32,
    max_reply_params: u16,
    max_reply_data: u16,
    max_reply_setup: u8,
    out_params: Chain,
    out_data: Chain,
    in_params: Option<Bytes>,
    in_data: Option<Bytes>,
}

impl Transaction {
    pub fn new(conn: &Arc<Connection>, target: TxnTarget) -> Result<Self> {
        let rq = Request::new(conn, target.primary_command())?;
        Ok(Self {
            target,
            rq,
            setup: Vec::new(),
            txn_flags: 0,
            timeout: 0,
            max_reply_params: u16::MAX,
            max_reply_data: u16::MAX,
            max_reply_setup: MAX_SETUP_WORDS as u8,
            out_params: Chain::new(),
            out_data: Chain::new(),
            in_params: None,
            in_data: None,
        })
    }

    /// Setup words sent in the primary packet.
    pub fn set_setup(&mut self, setup: Vec<u16>) -> Result<()> {
        if setup.len() > MAX_SETUP_WORDS {
            return Err(Error::Config(format!(
                "transaction setup too long: {} words, at most {} allowed",
                setup.len(),
                MAX_SETUP_WORDS
            )));
        }
        self.setup = setup;
        Ok(())
    }

    /// Outbound parameter stream.
    pub fn set_params(&mut self, params: Chain) {
        self.out_params = params;
    }

    /// Outbound data stream.
    pub fn set_data(&mut self, data: Chain) {
        self.out_data = data;
    }

    /// Largest reply parameter/data counts the caller will accept.
    pub fn set_reply_limits(&mut self, max_params: u16, max_data: u16) {
        self.max_reply_params = max_params;
        self.max_reply_data = max_data;
    }

    pub fn set_txn_flags(&mut self, flags: u16) {
        self.txn_flags = flags;
    }

    pub fn set_timeout(&mut self, timeout: u32) {
        self.timeout = timeout;
    }

    /// Forbid the outer retry loop from re-attempting this transaction.
    pub fn deny_restart(&mut self) {
        self.rq.deny_restart();
    }

    pub fn target(&self) -> &TxnTarget {
        &self.target
    }

    /// Underlying primary request (correlation id, state, callback).
    pub fn request(&self) -> &Request {
        &self.rq
    }

    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.rq
    }

    /// Reassembled reply parameter stream, populated on success.
    pub fn take_reply_params(&mut self) -> Option<Bytes> {
        self.in_params.take()
    }

    /// Reassembled reply data stream, populated on success.
    pub fn take_reply_data(&mut self) -> Option<Bytes> {
        self.in_data.take()
    }
}

/// One packet's worth of the two streams, offsets relative to message start.
#[derive(Debug)]
struct Packed {
    param_offset: usize,
    this_p: usize,
    data_offset: usize,
    this_d: usize,
}

/// Parameters-first packing: fill the packet with parameter bytes, then give
/// data whatever room is left. Offsets are 4-byte aligned and computed before
/// any content is appended.
fn pack(tx_max: usize, fixed_end: usize, rem_p: usize, rem_d: usize) -> Result<Packed> {
    let param_offset = align4(fixed_end);
    let budget = tx_max.saturating_sub(param_offset);
    let this_p = rem_p.min(budget);

    let data_offset = align4(param_offset + this_p);
    let this_d = if rem_p > budget {
        0
    } else {
        rem_d.min(tx_max.saturating_sub(data_offset))
    };

    if this_p == 0 && this_d == 0 && (rem_p > 0 || rem_d > 0) {
        return Err(Error::Config(format!(
            "transaction maximum {tx_max} too small for any payload past offset {param_offset}"
        )));
    }
    Ok(Packed {
        param_offset,
        this_p,
        data_offset,
        this_d,
    })
}

/// Write `count` bytes from the front of `chain` at absolute `offset`.
fn emit(b: &mut MessageBuilder, chain: &mut Chain, offset: usize, count: usize) {
    if count == 0 {
        return;
    }
    let rest = std::mem::take(chain);
    let (head, rest) = rest.split_at(count);
    *chain = rest;
    b.pad_to(offset);
    b.put_slice(&head.linearize());
}

/// Slice `count` bytes at `offset` out of the raw reply message.
fn splice(raw: &Bytes, offset: usize, count: usize) -> Result<Bytes> {
    if offset < HEADER_SIZE || offset.checked_add(count).map_or(true, |end| end > raw.len()) {
        return Err(Error::Protocol(format!(
            "transaction fragment out of bounds: offset {offset} count {count} in {} byte reply",
            raw.len()
        )));
    }
    Ok(raw.slice(offset..offset + count))
}

/// Fixed fields of a transaction reply.
struct ReplyFields {
    total_p: usize,
    total_d: usize,
    p_count: usize,
    p_offset: usize,
    p_disp: usize,
    d_count: usize,
    d_offset: usize,
    d_disp: usize,
}

fn parse_reply_fields(body: &[u8]) -> ReplyFields {
    let u = |i: usize| u16::from_le_bytes([body[i], body[i + 1]]) as usize;
    ReplyFields {
        total_p: u(0),
        total_d: u(2),
        // body[4..6] reserved
        p_count: u(6),
        p_offset: u(8),
        p_disp: u(10),
        d_count: u(12),
        d_offset: u(14),
        d_disp: u(16),
        // setup_count:1 + reserved:1 at 18..20, setup words and byte count
        // beyond are ignored here
    }
}

/// Splits, sends, and reassembles transactions over a [`RequestEngine`].
#[derive(Debug, Clone)]
pub struct TransactionEngine {
    engine: RequestEngine,
    scratch: Pool<BytesMut>,
}

impl TransactionEngine {
    pub fn new(engine: RequestEngine) -> Self {
        Self {
            engine,
            scratch: Pool::new(8),
        }
    }

    pub fn request_engine(&self) -> &RequestEngine {
        &self.engine
    }

    /// Run the transaction to completion with bounded restart-retry.
    ///
    /// Each attempt rebuilds the primary from the original streams; a failed
    /// attempt never leaves partial reply bytes behind.
    pub async fn transact(&self, txn: &mut Transaction) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self.attempt(txn).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    let restart = txn.rq.restart_signaled() && !txn.rq.restart_denied();
                    if !restart || attempts >= MAX_RETRY {
                        if restart {
                            tracing::warn!(
                                command = txn.rq.command(),
                                attempts,
                                "transaction retries exhausted"
                            );
                        }
                        return Err(e);
                    }
                    tracing::debug!(
                        command = txn.rq.command(),
                        attempt = attempts,
                        "transport signaled restart, re-running transaction"
                    );
                }
            }
        }
    }

    /// One full send + receive pass.
    async fn attempt(&self, txn: &mut Transaction) -> Result<()> {
        txn.in_params = None;
        txn.in_data = None;
        txn.rq.reset();
        txn.rq.reset_body();

        let total_p = txn.out_params.len();
        let total_d = txn.out_data.len();
        if total_p > u16::MAX as usize || total_d > u16::MAX as usize {
            return Err(Error::Config(format!(
                "transaction streams too large: {total_p} parameter and {total_d} data bytes, \
                 each stream is limited to 65535"
            )));
        }

        let conn = Arc::clone(self.engine.connection());
        let tx_max = conn.tx_max().min(u16::MAX as usize);

        // Re-splitting consumes the chains, so each attempt works on cheap
        // segment-sharing clones of the originals.
        let mut rem_p = txn.out_params.clone();
        let mut rem_d = txn.out_data.clone();

        let (sent_p, sent_d) = self.send_primary(txn, tx_max, &mut rem_p, &mut rem_d).await?;
        self.send_secondaries(txn, tx_max, &mut rem_p, &mut rem_d, sent_p, sent_d)
            .await?;

        let (envelope, params, data) = self.receive_all(txn).await?;
        txn.in_params = Some(params);
        txn.in_data = Some(data);
        txn.rq.complete(envelope, Bytes::new());
        Ok(())
    }

    /// Build and submit the primary packet; returns the bytes it carried.
    async fn send_primary(
        &self,
        txn: &mut Transaction,
        tx_max: usize,
        rem_p: &mut Chain,
        rem_d: &mut Chain,
    ) -> Result<(usize, usize)> {
        let total_p = rem_p.len();
        let total_d = rem_d.len();
        let trailing_len = match &txn.target {
            TxnTarget::Named(name) => name.len() + 1,
            TxnTarget::Typed(_) => 1,
        };
        // envelope + fixed fields + setup words + byte count + name/pad
        let fixed_end = HEADER_SIZE + 28 + 2 * txn.setup.len() + 2 + trailing_len;
        let packed = pack(tx_max, fixed_end, total_p, total_d)?;

        {
            let b = txn.rq.builder_mut();
            b.put_u16(total_p as u16);
            b.put_u16(total_d as u16);
            b.put_u16(txn.max_reply_params);
            b.put_u16(txn.max_reply_data);
            b.put_u8(txn.max_reply_setup);
            b.put_u8(0);
            b.put_u16(txn.txn_flags);
            b.put_u32(txn.timeout);
            b.put_u16(0);
            b.put_u16(packed.this_p as u16);
            b.put_u16(packed.param_offset as u16);
            b.put_u16(packed.this_d as u16);
            b.put_u16(packed.data_offset as u16);
            b.put_u8(txn.setup.len() as u8);
            b.put_u8(0);
            for word in &txn.setup {
                b.put_u16(*word);
            }
            let byte_count = b.open_byte_field();
            match &txn.target {
                TxnTarget::Named(name) => {
                    b.put_slice(name.as_bytes());
                    b.put_u8(0);
                }
                TxnTarget::Typed(_) => b.put_u8(0),
            }
            emit(b, rem_p, packed.param_offset, packed.this_p);
            emit(b, rem_d, packed.data_offset, packed.this_d);
            b.close_byte_field(byte_count)?;
            debug_assert!(b.len() <= tx_max);
        }

        if !rem_p.is_empty() || !rem_d.is_empty() {
            txn.rq.mark_multi_packet();
        }
        self.engine.submit(&mut txn.rq).await?;
        Ok((packed.this_p, packed.this_d))
    }

    /// Send secondaries until both streams are fully on the wire.
    ///
    /// Secondaries reuse the primary's correlation id and go through the
    /// single-shot send path; the transaction's own outer retry covers them.
    async fn send_secondaries(
        &self,
        txn: &Transaction,
        tx_max: usize,
        rem_p: &mut Chain,
        rem_d: &mut Chain,
        mut sent_p: usize,
        mut sent_d: usize,
    ) -> Result<()> {
        let total_p = sent_p + rem_p.len();
        let total_d = sent_d + rem_d.len();
        let conn = self.engine.connection();

        while !rem_p.is_empty() || !rem_d.is_empty() {
            let mut sec = Request::with_scratch(
                conn,
                txn.target.secondary_command(),
                self.scratch.take(),
            )?;
            sec.mark_internal();
            sec.set_correlation_id(txn.rq.correlation_id())?;

            let trailing_len = match txn.target {
                TxnTarget::Named(_) => 0,
                TxnTarget::Typed(_) => 2,
            };
            let fixed_end = HEADER_SIZE + 16 + trailing_len;
            let packed = pack(tx_max, fixed_end, rem_p.len(), rem_d.len())?;

            {
                let b = sec.builder_mut();
                b.put_u16(total_p as u16);
                b.put_u16(total_d as u16);
                b.put_u16(packed.this_p as u16);
                b.put_u16(packed.param_offset as u16);
                b.put_u16(sent_p as u16);
                b.put_u16(packed.this_d as u16);
                b.put_u16(packed.data_offset as u16);
                b.put_u16(sent_d as u16);
                if let TxnTarget::Typed(file_id) = txn.target {
                    b.put_u16(file_id);
                }
                emit(b, rem_p, packed.param_offset, packed.this_p);
                emit(b, rem_d, packed.data_offset, packed.this_d);
                debug_assert!(b.len() <= tx_max);
            }

            let message = sec.freeze()?;
            self.engine
                .transport()
                .send(sec.correlation_id(), message)
                .await?;
            sent_p += packed.this_p;
            sent_d += packed.this_d;
        }
        Ok(())
    }

    /// Receive reply fragments until both streams are complete.
    ///
    /// Totals are clamped to the running minimum across fragments, so the
    /// server may legitimately shrink them mid-stream. Fragments must land at
    /// exactly the running received count per stream; anything else is a
    /// terminal protocol error and all partial reassembly is dropped.
    async fn receive_all(&self, txn: &mut Transaction) -> Result<(ReplyEnvelope, Bytes, Bytes)> {
        let mut total_p = usize::MAX;
        let mut total_d = usize::MAX;
        let mut got_p = 0usize;
        let mut got_d = 0usize;
        let mut params = Chain::new();
        let mut data = Chain::new();

        loop {
            let (envelope, raw, body) = self.engine.next_reply(&mut txn.rq).await?;

            if body.is_empty() {
                // Interim acknowledgement, the real reply follows.
                tracing::trace!(
                    correlation_id = envelope.correlation_id,
                    "discarding interim transaction acknowledgement"
                );
                continue;
            }
            if body.len() < REPLY_FIXED_SIZE {
                txn.rq.fail(false);
                return Err(Error::Protocol(format!(
                    "truncated transaction reply: {} bytes of fixed fields, need {}",
                    body.len(),
                    REPLY_FIXED_SIZE
                )));
            }

            let fields = parse_reply_fields(&body);
            total_p = total_p.min(fields.total_p);
            total_d = total_d.min(fields.total_d);

            if fields.p_count > 0 {
                if fields.p_disp != got_p {
                    txn.rq.fail(false);
                    return Err(Error::Protocol(format!(
                        "parameter fragment out of order: displacement {} with {} bytes received",
                        fields.p_disp, got_p
                    )));
                }
                params.push(splice(&raw, fields.p_offset, fields.p_count)?);
                got_p += fields.p_count;
            }
            if fields.d_count > 0 {
                if fields.d_disp != got_d {
                    txn.rq.fail(false);
                    return Err(Error::Protocol(format!(
                        "data fragment out of order: displacement {} with {} bytes received",
                        fields.d_disp, got_d
                    )));
                }
                data.push(splice(&raw, fields.d_offset, fields.d_count)?);
                got_d += fields.d_count;
            }

            if got_p >= total_p && got_d >= total_d {
                return Ok((envelope, params.linearize(), data.linearize()));
            }
        }
    }
}
