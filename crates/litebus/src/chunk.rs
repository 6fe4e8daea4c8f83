// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Chunked UDP framing.
//!
//! A reply larger than one datagram is split into chunks, each prefixed with
//! a 4-byte big-endian byte offset into the full reply. Chunks go out in
//! descending offset order, so the offset-0 datagram doubles as the
//! end-of-data marker. A zero-payload offset-0 datagram is a beacon: it
//! re-announces an unacknowledged delivery and is ignored by receivers up to
//! a small budget.
//!
//! [`Reassembler`] is a pure state machine; the socket loop lives with the
//! caller, which keeps gap detection and retransmit bookkeeping unit-testable.

use crate::config::{IGNORE_EOD_COUNT, MAX_GAP_BYTES, MAX_RETRANSMIT_TRIES, PREFIX_LEN};
use std::collections::BTreeMap;

/// One outbound datagram of a chunked reply.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Byte offset of the payload within the full reply.
    pub offset: u32,
    /// Payload length (prefix excluded).
    pub size: u32,
    /// The wire datagram: offset prefix followed by the payload slice.
    pub datagram: Vec<u8>,
}

/// Split `buf` into prefixed chunks of at most `chunk_size` payload bytes,
/// in descending offset order. An empty buffer yields no chunks.
#[must_use]
pub fn split(buf: &[u8], chunk_size: usize) -> Vec<Chunk> {
    if buf.is_empty() {
        return Vec::new();
    }
    let n_chunks = (buf.len() - 1) / chunk_size + 1;
    let mut chunks = Vec::with_capacity(n_chunks);
    for index in (0..n_chunks).rev() {
        let start = index * chunk_size;
        let end = ((index + 1) * chunk_size).min(buf.len());
        let offset = start as u32;
        let mut datagram = Vec::with_capacity(PREFIX_LEN + end - start);
        datagram.extend_from_slice(&offset.to_be_bytes());
        datagram.extend_from_slice(&buf[start..end]);
        chunks.push(Chunk {
            offset,
            size: (end - start) as u32,
            datagram,
        });
    }
    chunks
}

/// What the caller should do after feeding one datagram to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Keep receiving.
    NeedMore,
    /// The reply is fully assembled; call [`Reassembler::assemble`].
    Complete,
    /// Ask the sender to retransmit this `(offset, length)` span.
    Retransmit { offset: u32, size: u32 },
    /// Reassembly is unrecoverable; the transfer yields no data.
    Failed(String),
}

/// Collects chunks of one reply and decides when it is whole.
pub struct Reassembler {
    chunks: BTreeMap<u32, Vec<u8>>,
    ignore_eod: i32,
    pending_retransmit: Option<(u32, u32)>,
    tries_left: u32,
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
            ignore_eod: IGNORE_EOD_COUNT as i32,
            pending_retransmit: None,
            tries_left: MAX_RETRANSMIT_TRIES,
        }
    }

    /// Feed one received datagram.
    pub fn push(&mut self, datagram: &[u8]) -> Step {
        if datagram.len() < PREFIX_LEN {
            return Step::Failed(format!("short datagram of {} bytes", datagram.len()));
        }
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&datagram[..PREFIX_LEN]);
        let offset = u32::from_be_bytes(prefix);
        let payload = &datagram[PREFIX_LEN..];

        if !payload.is_empty() {
            self.chunks.insert(offset, payload.to_vec());
        }

        // Until the offset-0 datagram arrives there is nothing to check,
        // unless a retransmit answer is due.
        if offset > 0 && self.pending_retransmit.is_none() {
            return Step::NeedMore;
        }

        if payload.is_empty() {
            // Beacon. Echoes of a previous transfer are expected; a stream of
            // them without data means the transfer never started for us.
            self.ignore_eod -= 1;
            if self.ignore_eod >= 0 {
                return Step::NeedMore;
            }
            return Step::Failed("first chunk is missing".to_string());
        }

        self.pending_retransmit = None;
        self.check_gaps()
    }

    /// Walk the sorted offsets; the first hole becomes a retransmit request.
    fn check_gaps(&mut self) -> Step {
        let mut expected: u32 = 0;
        for (&offset, payload) in &self.chunks {
            if offset != expected {
                let gap = offset - expected;
                if gap > MAX_GAP_BYTES {
                    return Step::Failed(format!("lost too many bytes at offset {expected}: {gap}"));
                }
                if self.tries_left == 0 {
                    return Step::Failed(format!(
                        "partial assembly of {} chunks",
                        self.chunks.len()
                    ));
                }
                self.tries_left -= 1;
                self.pending_retransmit = Some((expected, gap));
                return Step::Retransmit {
                    offset: expected,
                    size: gap,
                };
            }
            expected = offset + payload.len() as u32;
        }
        Step::Complete
    }

    /// Number of chunks collected so far.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate the collected chunks into the full reply.
    #[must_use]
    pub fn assemble(self) -> Vec<u8> {
        let total: usize = self.chunks.values().map(Vec::len).sum();
        let mut data = Vec::with_capacity(total);
        for payload in self.chunks.values() {
            data.extend_from_slice(payload);
        }
        data
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BEACON;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_split_descending_last_is_offset_zero() {
        let buf = payload(2500);
        let chunks = split(&buf, 1000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].offset, 2000);
        assert_eq!(chunks[1].offset, 1000);
        assert_eq!(chunks[2].offset, 0);
        assert_eq!(chunks[0].size, 500);
        assert_eq!(chunks[2].size, 1000);
        assert_eq!(&chunks[2].datagram[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_split_single_chunk() {
        let buf = payload(10);
        let chunks = split(&buf, 1000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(&chunks[0].datagram[4..], &buf[..]);
    }

    #[test]
    fn test_split_empty_buffer_yields_nothing() {
        assert!(split(&[], 1000).is_empty());
    }

    #[test]
    fn test_roundtrip_exact_multiple_of_chunk_size() {
        let buf = payload(3000);
        let chunks = split(&buf, 1000);
        assert_eq!(chunks.len(), 3);
        let mut reassembler = Reassembler::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let step = reassembler.push(&chunk.datagram);
            if i + 1 == chunks.len() {
                assert_eq!(step, Step::Complete);
            } else {
                assert_eq!(step, Step::NeedMore);
            }
        }
        assert_eq!(reassembler.assemble(), buf);
    }

    #[test]
    fn test_roundtrip_random_sizes() {
        for _ in 0..20 {
            let len = fastrand::usize(1..20_000);
            let chunk_size = fastrand::usize(64..4096);
            let buf: Vec<u8> = (0..len).map(|_| fastrand::u8(..)).collect();
            let chunks = split(&buf, chunk_size);
            let mut reassembler = Reassembler::new();
            let mut done = false;
            for chunk in &chunks {
                match reassembler.push(&chunk.datagram) {
                    Step::NeedMore => {}
                    Step::Complete => done = true,
                    other => panic!("unexpected step {other:?}"),
                }
            }
            assert!(done, "len={len} chunk_size={chunk_size}");
            assert_eq!(reassembler.assemble(), buf);
        }
    }

    #[test]
    fn test_dropped_middle_chunk_requests_exact_span() {
        let buf = payload(5000);
        let chunks = split(&buf, 1000);
        let dropped = chunks[2].clone(); // offset 2000
        let mut reassembler = Reassembler::new();
        let mut retransmit = None;
        for chunk in chunks.iter().filter(|c| c.offset != dropped.offset) {
            match reassembler.push(&chunk.datagram) {
                Step::NeedMore => {}
                Step::Retransmit { offset, size } => retransmit = Some((offset, size)),
                other => panic!("unexpected step {other:?}"),
            }
        }
        assert_eq!(retransmit, Some((dropped.offset, dropped.size)));
        // The retransmitted datagram completes the transfer.
        assert_eq!(reassembler.push(&dropped.datagram), Step::Complete);
        assert_eq!(reassembler.assemble(), buf);
    }

    #[test]
    fn test_beacons_ignored_before_data() {
        let buf = payload(100);
        let chunks = split(&buf, 1000);
        let mut reassembler = Reassembler::new();
        for _ in 0..3 {
            assert_eq!(reassembler.push(&BEACON), Step::NeedMore);
        }
        assert_eq!(reassembler.push(&chunks[0].datagram), Step::Complete);
        assert_eq!(reassembler.assemble(), buf);
    }

    #[test]
    fn test_beacon_budget_exhaustion_fails() {
        let mut reassembler = Reassembler::new();
        for _ in 0..3 {
            assert_eq!(reassembler.push(&BEACON), Step::NeedMore);
        }
        assert!(matches!(reassembler.push(&BEACON), Step::Failed(_)));
    }

    #[test]
    fn test_gap_wider_than_limit_fails() {
        let buf = payload(200_000);
        let chunks = split(&buf, 1000);
        let mut reassembler = Reassembler::new();
        // Deliver only the first (highest-offset) and last (offset 0) chunks:
        // the hole between them is far wider than a datagram.
        assert_eq!(reassembler.push(&chunks[0].datagram), Step::NeedMore);
        let step = reassembler.push(&chunks[chunks.len() - 1].datagram);
        assert!(matches!(step, Step::Failed(_)), "got {step:?}");
    }

    #[test]
    fn test_retransmit_attempts_bounded() {
        let buf = payload(3000);
        let chunks = split(&buf, 1000);
        let mut reassembler = Reassembler::new();
        reassembler.push(&chunks[0].datagram); // offset 2000
        // offset 0 arrives, offset 1000 missing: each EOD-triggering push
        // burns one retransmit attempt.
        let mut failed = false;
        for _ in 0..(MAX_RETRANSMIT_TRIES + 1) {
            match reassembler.push(&chunks[2].datagram) {
                Step::Retransmit { offset, size } => {
                    assert_eq!((offset, size), (1000, 1000));
                }
                Step::Failed(_) => {
                    failed = true;
                    break;
                }
                other => panic!("unexpected step {other:?}"),
            }
        }
        assert!(failed);
    }

    #[test]
    fn test_short_datagram_fails() {
        let mut reassembler = Reassembler::new();
        assert!(matches!(reassembler.push(&[0, 1]), Step::Failed(_)));
    }
}
