//! # Stream Data Reassembly Buffer (RFC 9000 Section 2.2)
//!
//! QUIC packets can arrive out of order, be lost and retransmitted, or carry
//! overlapping retransmissions of the same range. Stream data must still be
//! delivered to the application **in order**.
//!
//! The buffer keeps two regions:
//!
//! 1. **Ready**: contiguous data starting at the read offset, queued for the
//!    reader.
//! 2. **Fragments**: out-of-order ranges beyond the contiguous offset,
//!    waiting for the gap before them to fill.
//!
//! ```text
//!   read offset      contiguous offset
//!       |                  |
//!       v                  v
//!       [ ready ........ ]   [frag]   [frag ....]   [frag]
//! ```
//!
//! Payloads are `bytes::Bytes` slices of the received packets. Overlaps are
//! resolved by slicing, so no byte is ever copied or stored twice.

#![forbid(unsafe_code)]

use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};

/// Reordering buffer for one receiving stream.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    /// Out-of-order ranges keyed by offset. Never overlapping, all at or
    /// beyond `contiguous`.
    fragments: BTreeMap<u64, Bytes>,

    /// Bytes held in `fragments`
    fragment_bytes: u64,

    /// In-order data not yet read
    ready: VecDeque<Bytes>,

    /// Bytes held in `ready`
    ready_bytes: u64,

    /// End of the in-order prefix
    contiguous: u64,
}

impl ReceiveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `data` received at `offset`.
    ///
    /// Bytes already received are dropped. Returns how many bytes became
    /// readable as a result.
    pub fn insert(&mut self, offset: u64, data: Bytes) -> u64 {
        let end = offset + data.len() as u64;
        if end <= self.contiguous {
            return 0;
        }

        // Fill only the gaps not covered by existing fragments
        let mut cursor = offset.max(self.contiguous);
        if let Some((&start, frag)) = self.fragments.range(..=cursor).next_back() {
            cursor = cursor.max(start + frag.len() as u64);
        }

        let mut pieces = Vec::new();
        if cursor < end {
            for (&start, frag) in self.fragments.range(cursor..end) {
                if start > cursor {
                    pieces.push((cursor, slice(&data, offset, cursor, start)));
                }
                cursor = cursor.max(start + frag.len() as u64);
                if cursor >= end {
                    break;
                }
            }
        }
        if cursor < end {
            pieces.push((cursor, slice(&data, offset, cursor, end)));
        }

        for (start, piece) in pieces {
            self.fragment_bytes += piece.len() as u64;
            self.fragments.insert(start, piece);
        }

        self.release_contiguous()
    }

    /// Move fragments adjacent to the in-order prefix into the ready queue.
    fn release_contiguous(&mut self) -> u64 {
        let mut released = 0;
        while let Some(entry) = self.fragments.first_entry() {
            if *entry.key() != self.contiguous {
                break;
            }
            let piece = entry.remove();
            let len = piece.len() as u64;
            self.fragment_bytes -= len;
            self.contiguous += len;
            self.ready_bytes += len;
            released += len;
            self.ready.push_back(piece);
        }
        released
    }

    /// Take up to `max_len` in-order bytes.
    pub fn read(&mut self, max_len: usize) -> Option<Bytes> {
        let front = self.ready.front_mut()?;
        let chunk = if front.len() <= max_len {
            self.ready.pop_front()?
        } else {
            front.split_to(max_len)
        };
        self.ready_bytes -= chunk.len() as u64;
        Some(chunk)
    }

    /// Take the next in-order chunk, whatever its size.
    pub fn read_chunk(&mut self) -> Option<Bytes> {
        let chunk = self.ready.pop_front()?;
        self.ready_bytes -= chunk.len() as u64;
        Some(chunk)
    }

    /// Drop the in-order data without reading it, keeping out-of-order
    /// fragments so contiguity is still tracked. Returns the bytes dropped.
    pub fn discard_readable(&mut self) -> u64 {
        let discarded = self.ready_bytes;
        self.ready.clear();
        self.ready_bytes = 0;
        discarded
    }

    /// Drop everything. Returns the number of readable bytes discarded.
    pub fn clear(&mut self) -> u64 {
        let discarded = self.ready_bytes;
        self.fragments.clear();
        self.ready.clear();
        self.fragment_bytes = 0;
        self.ready_bytes = 0;
        discarded
    }

    /// Bytes ready for the reader
    pub fn readable(&self) -> u64 {
        self.ready_bytes
    }

    /// End of the in-order prefix received so far
    pub fn contiguous_offset(&self) -> u64 {
        self.contiguous
    }

    /// Offset of the next byte the reader will get
    pub fn read_offset(&self) -> u64 {
        self.contiguous - self.ready_bytes
    }

    /// Number of out-of-order fragments waiting for a gap to fill
    pub fn pending_fragments(&self) -> usize {
        self.fragments.len()
    }

    pub fn pending_fragment_bytes(&self) -> u64 {
        self.fragment_bytes
    }

    /// True if more than `max_fragments` fragments are buffered and their
    /// average size is below `min_average_size`.
    pub fn is_excessively_fragmented(&self, max_fragments: usize, min_average_size: u64) -> bool {
        let count = self.fragments.len();
        count > max_fragments && self.fragment_bytes / (count as u64) < min_average_size
    }
}

/// Sub-slice of `data` (which starts at stream offset `base`) covering
/// stream offsets `from..to`.
fn slice(data: &Bytes, base: u64, from: u64, to: u64) -> Bytes {
    data.slice((from - base) as usize..(to - base) as usize)
}
