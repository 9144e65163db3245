//! Owned, splittable, appendable byte chain.
//!
//! A [`Chain`] is a sequence of `bytes::Bytes` segments that behaves like one
//! logical byte string. Splitting produces two new owners from one (the
//! source is consumed) and concatenation transfers ownership of its argument,
//! so fragments can be spliced between chains without copying and without
//! aliasing.
//!
//! The transaction engine accumulates reply fragments this way: each fragment
//! is sliced out of the raw reply message and pushed onto the result chain,
//! then the finished chain is flattened once with [`Chain::linearize`].

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

/// A chain of owned byte segments.
#[derive(Debug, Clone, Default)]
pub struct Chain {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl Chain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of bytes across all segments.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the chain holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a segment, taking ownership. Empty segments are dropped.
    pub fn push(&mut self, segment: Bytes) {
        if segment.is_empty() {
            return;
        }
        self.len += segment.len();
        self.segments.push_back(segment);
    }

    /// Append another chain, transferring ownership of its segments.
    pub fn concat(&mut self, mut other: Chain) {
        self.len += other.len;
        self.segments.append(&mut other.segments);
    }

    /// Split the chain at `offset`, consuming it.
    ///
    /// Returns the first `offset` bytes and the remainder as two independent
    /// chains. The segment straddling the boundary is split zero-copy.
    ///
    /// # Panics
    ///
    /// Panics if `offset > self.len()`.
    pub fn split_at(mut self, offset: usize) -> (Chain, Chain) {
        assert!(offset <= self.len, "split offset {} out of range", offset);

        let mut head = Chain::new();
        let mut remaining = offset;

        while remaining > 0 {
            // len invariant guarantees a segment exists while remaining > 0
            let mut seg = match self.segments.pop_front() {
                Some(seg) => seg,
                None => break,
            };
            self.len -= seg.len();

            if seg.len() <= remaining {
                remaining -= seg.len();
                head.push(seg);
            } else {
                let front = seg.split_to(remaining);
                remaining = 0;
                head.push(front);
                self.len += seg.len();
                self.segments.push_front(seg);
            }
        }

        (head, self)
    }

    /// Flatten the chain into one contiguous `Bytes`, consuming it.
    ///
    /// Zero-copy when the chain holds zero or one segment.
    pub fn linearize(mut self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments.pop_front().unwrap_or_default(),
            _ => {
                let mut out = BytesMut::with_capacity(self.len);
                for seg in &self.segments {
                    out.put_slice(seg);
                }
                out.freeze()
            }
        }
    }
}

impl From<Bytes> for Chain {
    fn from(segment: Bytes) -> Self {
        let mut chain = Chain::new();
        chain.push(segment);
        chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_of(parts: &[&[u8]]) -> Chain {
        let mut c = Chain::new();
        for p in parts {
            c.push(Bytes::copy_from_slice(p));
        }
        c
    }

    #[test]
    fn test_empty_chain() {
        let c = Chain::new();
        assert_eq!(c.len(), 0);
        assert!(c.is_empty());
        assert_eq!(c.linearize(), Bytes::new());
    }

    #[test]
    fn test_push_tracks_length() {
        let c = chain_of(&[b"abc", b"", b"defg"]);
        assert_eq!(c.len(), 7);
        assert_eq!(c.linearize(), Bytes::from_static(b"abcdefg"));
    }

    #[test]
    fn test_concat_transfers_ownership() {
        let mut a = chain_of(&[b"head"]);
        let b = chain_of(&[b"-", b"tail"]);
        a.concat(b);
        assert_eq!(a.len(), 9);
        assert_eq!(a.linearize(), Bytes::from_static(b"head-tail"));
    }

    #[test]
    fn test_split_at_segment_boundary() {
        let c = chain_of(&[b"abc", b"def"]);
        let (head, tail) = c.split_at(3);
        assert_eq!(head.linearize(), Bytes::from_static(b"abc"));
        assert_eq!(tail.linearize(), Bytes::from_static(b"def"));
    }

    #[test]
    fn test_split_at_mid_segment() {
        let c = chain_of(&[b"abcdef"]);
        let (head, tail) = c.split_at(2);
        assert_eq!(head.linearize(), Bytes::from_static(b"ab"));
        assert_eq!(tail.linearize(), Bytes::from_static(b"cdef"));
    }

    #[test]
    fn test_split_at_edges() {
        let c = chain_of(&[b"abc"]);
        let (head, tail) = c.split_at(0);
        assert!(head.is_empty());
        assert_eq!(tail.len(), 3);

        let c = chain_of(&[b"abc"]);
        let (head, tail) = c.split_at(3);
        assert_eq!(head.len(), 3);
        assert!(tail.is_empty());
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_split_past_end_panics() {
        let c = chain_of(&[b"abc"]);
        let _ = c.split_at(4);
    }

    #[test]
    fn test_linearize_single_segment_zero_copy() {
        let payload = Bytes::from_static(b"single");
        let ptr = payload.as_ptr();
        let c = Chain::from(payload);
        let flat = c.linearize();
        assert_eq!(flat.as_ptr(), ptr);
    }

    #[test]
    fn test_split_then_concat_round_trip() {
        let original = b"the quick brown fox jumps over the lazy dog";
        for cut in [0, 1, 10, 20, original.len()] {
            let c = chain_of(&[&original[..7], &original[7..30], &original[30..]]);
            let (mut head, tail) = c.split_at(cut);
            head.concat(tail);
            assert_eq!(head.linearize(), Bytes::copy_from_slice(original));
        }
    }
}
