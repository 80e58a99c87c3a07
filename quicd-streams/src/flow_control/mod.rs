//! # Flow Control (RFC 9000 Section 4)
//!
//! Stream-level flow control, from both ends of a stream:
//!
//! - [`TransferQueue`]: sending side. Buffers application data and releases
//!   it to the packet assembler only within the peer's MAX_STREAM_DATA.
//! - [`ReceiveCredit`]: receiving side. Tracks what we granted the peer and
//!   decides when to extend the grant as the reader consumes data.
//!
//! Connection-level flow control (MAX_DATA) belongs to the connection; the
//! stream layer only reports received and processed byte counts to it.

#![forbid(unsafe_code)]

pub mod queue;

pub use queue::{PollSignals, QueueChunk, SubmitError, SubmitSignals, TransferQueue};

/// Receive-side credit window for one stream.
///
/// **RFC 9000 Section 4.2**: the receiver advertises an absolute byte offset
/// (MAX_STREAM_DATA) the sender may not exceed. As the application reads, the
/// offset is moved forward so that roughly `window` bytes stay available.
#[derive(Debug, Clone)]
pub struct ReceiveCredit {
    /// Limit currently granted to the peer
    max_stream_data: u64,

    /// Highest offset received so far
    received: u64,

    /// Bytes read by the application or discarded
    processed: u64,

    /// Desired amount of outstanding credit
    window: u64,
}

impl ReceiveCredit {
    /// Create a window with the initial limit from our transport parameters.
    pub fn new(initial_max_stream_data: u64, window: u64) -> Self {
        Self {
            max_stream_data: initial_max_stream_data,
            received: 0,
            processed: 0,
            window: window.max(initial_max_stream_data),
        }
    }

    /// Limit currently granted to the peer
    pub fn max_stream_data(&self) -> u64 {
        self.max_stream_data
    }

    /// Highest offset received so far
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Check that data ending at `end_offset` stays within the grant.
    pub fn permits(&self, end_offset: u64) -> bool {
        end_offset <= self.max_stream_data
    }

    /// Record data ending at `end_offset`.
    ///
    /// Returns the number of bytes by which the high-water mark moved, which
    /// is what counts against connection-level flow control.
    pub fn on_received(&mut self, end_offset: u64) -> u64 {
        if end_offset > self.received {
            let diff = end_offset - self.received;
            self.received = end_offset;
            diff
        } else {
            0
        }
    }

    /// Record `n` bytes consumed.
    ///
    /// Returns the new limit when less than half of the window remains
    /// granted, at which point the caller should send MAX_STREAM_DATA.
    pub fn on_consumed(&mut self, n: u64) -> Option<u64> {
        self.processed += n;
        let remaining = self.max_stream_data.saturating_sub(self.processed);
        if remaining < self.window / 2 {
            Some(self.extend())
        } else {
            None
        }
    }

    /// Record `n` bytes dropped without a reader (stop-sending or reset).
    ///
    /// Never moves the limit: nobody will advertise it.
    pub fn on_discarded(&mut self, n: u64) {
        self.processed += n;
    }

    /// The peer reported STREAM_DATA_BLOCKED.
    ///
    /// Extends the limit if more than a quarter of the window has been
    /// consumed since the last grant. Otherwise the current limit is
    /// returned so it can be re-advertised in case the last MAX_STREAM_DATA
    /// was lost.
    pub fn on_data_blocked(&mut self) -> u64 {
        let desired = self.processed + self.window;
        if desired.saturating_sub(self.max_stream_data) > self.window / 4 {
            self.extend()
        } else {
            self.max_stream_data
        }
    }

    fn extend(&mut self) -> u64 {
        let desired = (self.processed + self.window).min(crate::types::VARINT_MAX);
        if desired > self.max_stream_data {
            self.max_stream_data = desired;
        }
        self.max_stream_data
    }
}
