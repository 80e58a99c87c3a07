//! # Flow-Controlled Transfer Queue
//!
//! Mailbox between one producer (the application writer) and one consumer
//! (the packet assembler) for the outbound bytes of a single stream.
//!
//! Two limits apply:
//!
//! - **Peer credit**: the consumer may only take bytes below the peer's
//!   MAX_STREAM_DATA (`bytes_consumed <= max_stream_data`).
//! - **Producer backpressure**: the producer is told to wait once
//!   `bytes_produced - bytes_consumed` reaches the configured buffer size.
//!   Submissions are still accepted past either limit; credit is enforced
//!   only when the consumer polls.
//!
//! The queue never calls out. Every mutating operation returns signals that
//! the caller acts on after the lock is released (waking the writer, marking
//! the stream ready, advancing the sending state machine).

#![forbid(unsafe_code)]

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The stream was reset locally or the peer asked us to stop sending.
    Reset,

    /// The final size was already declared.
    Finished,

    /// The queue was closed on connection termination.
    Closed,
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitSignals {
    /// The consumer had nothing to take before and now does.
    pub wake_consumer: bool,

    /// The buffer is at or above its cap; the producer should wait.
    pub producer_blocked: bool,
}

/// Side effects of a poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSignals {
    /// A waiting producer may submit again.
    pub wake_producer: bool,

    /// The FIN was taken: every byte up to the final size has been handed
    /// to the consumer.
    pub all_data_sent: bool,

    /// More can be polled right away.
    pub has_more: bool,

    /// Data is buffered but peer credit is exhausted at this limit.
    pub blocked_at: Option<u64>,
}

/// A range of stream bytes taken by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueChunk {
    pub offset: u64,
    pub data: Bytes,
    pub fin: bool,
}

#[derive(Debug)]
struct QueueState {
    buffers: VecDeque<Bytes>,
    bytes_produced: u64,
    bytes_consumed: u64,
    stream_size: Option<u64>,
    max_stream_data: u64,
    reset: bool,
    closed: bool,
    producer_blocked: bool,
    fin_polled: bool,
}

impl QueueState {
    fn buffered(&self) -> u64 {
        self.bytes_produced - self.bytes_consumed
    }

    fn credit(&self) -> u64 {
        self.max_stream_data.saturating_sub(self.bytes_consumed)
    }

    fn fin_pending(&self) -> bool {
        !self.fin_polled && self.stream_size == Some(self.bytes_consumed)
    }

    fn has_pollable(&self) -> bool {
        if self.closed || self.reset {
            return false;
        }
        (self.buffered() > 0 && self.credit() > 0) || self.fin_pending()
    }

    fn blocked_at(&self) -> Option<u64> {
        if !self.closed && !self.reset && self.buffered() > 0 && self.credit() == 0 {
            Some(self.max_stream_data)
        } else {
            None
        }
    }

    fn discard(&mut self) {
        self.buffers.clear();
        self.bytes_produced = self.bytes_consumed;
    }

    /// Remove exactly `n` buffered bytes, splitting without copying when a
    /// single buffer covers the range.
    fn take(&mut self, n: usize) -> Bytes {
        if n == 0 {
            return Bytes::new();
        }
        if let Some(front) = self.buffers.front_mut() {
            if front.len() >= n {
                let chunk = front.split_to(n);
                if front.is_empty() {
                    self.buffers.pop_front();
                }
                return chunk;
            }
        }

        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let Some(front) = self.buffers.front_mut() else {
                break;
            };
            let k = front.len().min(n - out.len());
            out.extend_from_slice(&front[..k]);
            front.advance(k);
            if front.is_empty() {
                self.buffers.pop_front();
            }
        }
        out.freeze()
    }
}

/// Outbound byte queue of one sending stream.
#[derive(Debug)]
pub struct TransferQueue {
    state: Mutex<QueueState>,
    buffer_size: u64,
}

impl TransferQueue {
    /// Create a queue with the peer's initial credit and a producer cap.
    pub fn new(max_stream_data: u64, buffer_size: u64) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buffers: VecDeque::new(),
                bytes_produced: 0,
                bytes_consumed: 0,
                stream_size: None,
                max_stream_data,
                reset: false,
                closed: false,
                producer_blocked: false,
                fin_polled: false,
            }),
            buffer_size,
        }
    }

    /// Append `data`, declaring the final size if `is_last`.
    pub fn submit(&self, data: Bytes, is_last: bool) -> Result<SubmitSignals, SubmitError> {
        let mut st = self.state.lock();
        if st.reset {
            return Err(SubmitError::Reset);
        }
        if st.closed {
            return Err(SubmitError::Closed);
        }
        if st.stream_size.is_some() {
            return Err(SubmitError::Finished);
        }

        let was_pollable = st.has_pollable();
        if !data.is_empty() {
            st.bytes_produced += data.len() as u64;
            st.buffers.push_back(data);
        }
        if is_last {
            st.stream_size = Some(st.bytes_produced);
        }

        let producer_blocked = st.buffered() >= self.buffer_size;
        if producer_blocked {
            st.producer_blocked = true;
        }

        Ok(SubmitSignals {
            wake_consumer: !was_pollable && st.has_pollable(),
            producer_blocked,
        })
    }

    /// Take up to `max_bytes` within the peer's credit.
    ///
    /// Returns `None` when nothing can be taken. A chunk may be empty if it
    /// only carries the FIN.
    pub fn poll(&self, max_bytes: u64) -> (Option<QueueChunk>, PollSignals) {
        let mut st = self.state.lock();
        let mut signals = PollSignals::default();
        if st.closed || st.reset {
            return (None, signals);
        }

        let n = max_bytes.min(st.credit()).min(st.buffered());
        let reaches_end = st.stream_size == Some(st.bytes_consumed + n);
        if n == 0 && !(reaches_end && !st.fin_polled) {
            // Pollable but for `max_bytes`; the caller keeps the stream ready
            signals.has_more = st.has_pollable();
            signals.blocked_at = st.blocked_at();
            return (None, signals);
        }

        let offset = st.bytes_consumed;
        let data = st.take(n as usize);
        st.bytes_consumed += n;

        let fin = st.stream_size == Some(st.bytes_consumed);
        if fin {
            st.fin_polled = true;
            signals.all_data_sent = true;
        }

        if st.producer_blocked && st.buffered() < self.buffer_size {
            st.producer_blocked = false;
            signals.wake_producer = true;
        }

        signals.has_more = st.has_pollable();
        signals.blocked_at = st.blocked_at();

        (Some(QueueChunk { offset, data, fin }), signals)
    }

    /// Raise the peer's credit. Lower or equal values are ignored.
    ///
    /// Returns true if the consumer was starved for credit and can now
    /// make progress.
    pub fn set_max_stream_data(&self, max_stream_data: u64) -> bool {
        let mut st = self.state.lock();
        if max_stream_data <= st.max_stream_data {
            return false;
        }
        let was_pollable = st.has_pollable();
        st.max_stream_data = max_stream_data;
        !was_pollable && st.has_pollable()
    }

    /// Bytes the producer may still submit before hitting the cap.
    ///
    /// Records the producer as waiting when the answer is zero, so the next
    /// poll that frees space reports `wake_producer`.
    pub fn producer_capacity(&self) -> u64 {
        let mut st = self.state.lock();
        let capacity = self.buffer_size.saturating_sub(st.buffered());
        if capacity == 0 && !st.reset && !st.closed {
            st.producer_blocked = true;
        }
        capacity
    }

    /// Mark the queue reset and drop buffered data.
    ///
    /// Returns the final size to put in RESET_STREAM: the bytes handed to
    /// the consumer so far.
    pub fn reset(&self) -> u64 {
        let mut st = self.state.lock();
        st.reset = true;
        st.producer_blocked = false;
        st.discard();
        st.bytes_consumed
    }

    /// Close the queue on connection termination, dropping buffered data.
    pub fn close(&self) {
        let mut st = self.state.lock();
        st.closed = true;
        st.producer_blocked = false;
        st.discard();
    }

    pub fn has_pollable(&self) -> bool {
        self.state.lock().has_pollable()
    }

    pub fn blocked_at(&self) -> Option<u64> {
        self.state.lock().blocked_at()
    }

    pub fn bytes_produced(&self) -> u64 {
        self.state.lock().bytes_produced
    }

    pub fn bytes_consumed(&self) -> u64 {
        self.state.lock().bytes_consumed
    }

    /// Bytes submitted but not yet taken
    pub fn buffered(&self) -> u64 {
        self.state.lock().buffered()
    }

    /// Final size, once declared
    pub fn stream_size(&self) -> Option<u64> {
        self.state.lock().stream_size
    }

    pub fn max_stream_data(&self) -> u64 {
        self.state.lock().max_stream_data
    }

    pub fn is_reset(&self) -> bool {
        self.state.lock().reset
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
