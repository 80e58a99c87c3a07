//! # Sending Part of a Stream (RFC 9000 Section 3.1)
//!
//! A [`SenderStream`] ties together:
//!
//! - the [`TransferQueue`] holding unsent application bytes,
//! - the sending state lattice,
//! - acknowledgement tracking, so the stream only reaches Data Recvd once
//!   every byte up to the final size has been acknowledged,
//! - the writer wakeup.
//!
//! Frame production is pull-based: the directory polls ready senders when
//! the connection assembles a packet. The sender never builds frames itself
//! except through [`SenderStream::produce`].

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::flow_control::{PollSignals, QueueChunk, SubmitError, TransferQueue};
use crate::stream::state::{SendingState, StateCell, TerminalState, Transition};
use crate::stream::StreamContext;
use crate::types::StreamId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Acknowledged byte ranges of a sending stream, merged as they arrive.
#[derive(Debug, Default)]
struct AckedRanges {
    /// start -> end, non-overlapping and non-adjacent
    ranges: BTreeMap<u64, u64>,
    fin_acked: bool,
}

impl AckedRanges {
    fn insert(&mut self, mut start: u64, mut end: u64) {
        if start >= end {
            return;
        }
        // Absorb a range that starts before and reaches `start`
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.ranges.remove(&s);
            }
        }
        // Absorb ranges starting inside [start, end]
        let inside: Vec<u64> = self.ranges.range(start..=end).map(|(&s, _)| s).collect();
        for s in inside {
            if let Some(e) = self.ranges.remove(&s) {
                end = end.max(e);
            }
        }
        self.ranges.insert(start, end);
    }

    /// True if `[0, size)` is acknowledged along with the FIN.
    fn covers(&self, size: u64) -> bool {
        if !self.fin_acked {
            return false;
        }
        if size == 0 {
            return true;
        }
        matches!(self.ranges.first_key_value(), Some((&0, &end)) if end >= size)
    }
}

#[derive(Debug, Default)]
struct SenderInner {
    writer_attached: bool,

    /// Error code of our RESET_STREAM
    reset_code: Option<u64>,

    /// Error code of the peer's STOP_SENDING
    stop_sending_code: Option<u64>,

    /// Connection termination reason
    closed: Option<String>,

    /// Limit for which STREAM_DATA_BLOCKED was last sent
    data_blocked_reported: Option<u64>,

    acked: AckedRanges,
}

/// The sending half of a stream.
#[derive(Debug)]
pub struct SenderStream {
    id: StreamId,
    state: StateCell<SendingState>,
    queue: TransferQueue,
    inner: Mutex<SenderInner>,
    writer_wakeup: Notify,
    ctx: StreamContext,
}

impl SenderStream {
    pub(crate) fn new(
        id: StreamId,
        max_stream_data: u64,
        send_buffer_size: u64,
        ctx: StreamContext,
    ) -> Self {
        Self {
            id,
            state: StateCell::new(SendingState::Ready),
            queue: TransferQueue::new(max_stream_data, send_buffer_size),
            inner: Mutex::new(SenderInner::default()),
            writer_wakeup: Notify::new(),
            ctx,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> SendingState {
        self.state.get()
    }

    /// Peer credit currently granted (MAX_STREAM_DATA)
    pub fn max_stream_data(&self) -> u64 {
        self.queue.max_stream_data()
    }

    /// Bytes handed to the packet assembler so far
    pub fn bytes_sent(&self) -> u64 {
        self.queue.bytes_consumed()
    }

    /// Bytes submitted by the application so far
    pub fn bytes_submitted(&self) -> u64 {
        self.queue.bytes_produced()
    }

    /// Bytes submitted but not yet handed to the packet assembler
    pub fn buffered(&self) -> u64 {
        self.queue.buffered()
    }

    /// True if the packet assembler can take something right now.
    pub fn has_data_to_send(&self) -> bool {
        self.queue.has_pollable()
    }

    fn switch_to(&self, to: SendingState) -> bool {
        let transition = self.state.switch_to(to);
        if let Transition::Switched { from } = transition {
            trace!(stream_id = %self.id, ?from, ?to, "sending state");
            if to.is_terminal() {
                self.ctx
                    .terminal_state(self.id, TerminalState::Sending(to));
            }
        }
        transition.switched()
    }

    /// The error a writer should see, if the stream can no longer be
    /// written to.
    fn write_error(&self) -> Option<Error> {
        let inner = self.inner.lock();
        if let Some(error_code) = inner.stop_sending_code {
            return Some(Error::StopSending {
                stream_id: self.id,
                error_code,
            });
        }
        if let Some(error_code) = inner.reset_code {
            return Some(Error::StreamReset {
                stream_id: self.id,
                error_code,
            });
        }
        if let Some(reason) = &inner.closed {
            return Some(Error::connection_closed(reason.clone()));
        }
        None
    }

    fn submit_error(&self, err: SubmitError) -> Error {
        match err {
            SubmitError::Finished => Error::StreamClosed(self.id),
            SubmitError::Reset | SubmitError::Closed => self
                .write_error()
                .unwrap_or(Error::StreamClosed(self.id)),
        }
    }

    /// Queue `data` for sending, declaring the end of the stream if
    /// `is_last`.
    ///
    /// Data beyond the peer's credit is accepted and held until credit
    /// arrives.
    pub fn submit(self: &Arc<Self>, data: Bytes, is_last: bool) -> Result<()> {
        if let Some(err) = self.write_error() {
            return Err(err);
        }
        if self.state() == SendingState::Ready {
            self.switch_to(SendingState::Send);
        }

        let signals = self
            .queue
            .submit(data, is_last)
            .map_err(|e| self.submit_error(e))?;

        if signals.wake_consumer {
            self.ctx.with_events(|events| events.data_available(self));
        }
        Ok(())
    }

    /// Bytes the writer may submit before being asked to wait.
    pub fn writer_capacity(&self) -> Result<u64> {
        if let Some(err) = self.write_error() {
            return Err(err);
        }
        Ok(self.queue.producer_capacity())
    }

    pub(crate) async fn wait_for_capacity(&self) -> Result<u64> {
        loop {
            let notified = self.writer_wakeup.notified();
            let capacity = self.writer_capacity()?;
            if capacity > 0 {
                return Ok(capacity);
            }
            notified.await;
        }
    }

    /// Take up to `max_bytes` for a STREAM frame.
    ///
    /// Moves the stream to Data Sent when the FIN is taken and wakes the
    /// writer when buffer space frees up.
    pub fn produce(&self, max_bytes: u64) -> (Option<QueueChunk>, PollSignals) {
        let (chunk, signals) = self.queue.poll(max_bytes);
        if signals.all_data_sent {
            self.switch_to(SendingState::DataSent);
        }
        if signals.wake_producer {
            self.writer_wakeup.notify_one();
        }
        (chunk, signals)
    }

    /// Record that STREAM_DATA_BLOCKED is being sent for `limit`.
    ///
    /// Returns false if it was already sent for this limit: a new one is
    /// only due after MAX_STREAM_DATA moves the limit.
    pub(crate) fn report_data_blocked(&self, limit: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.data_blocked_reported == Some(limit) {
            return false;
        }
        inner.data_blocked_reported = Some(limit);
        true
    }

    /// Apply MAX_STREAM_DATA. Lower or equal values are ignored.
    pub fn set_max_stream_data(self: &Arc<Self>, max_stream_data: u64) {
        if self.queue.set_max_stream_data(max_stream_data) {
            trace!(stream_id = %self.id, max_stream_data, "sender unblocked");
            self.ctx.with_events(|events| events.data_available(self));
        }
    }

    /// Abruptly stop sending (RFC 9000 Section 3.1).
    ///
    /// Drops unsent data and queues RESET_STREAM with a final size equal to
    /// the bytes already handed to the packet assembler. Returns false if
    /// the stream was already reset or fully acknowledged.
    pub fn reset(&self, error_code: u64) -> bool {
        if !self.switch_to(SendingState::ResetSent) {
            return false;
        }
        let final_size = self.queue.reset();
        self.inner.lock().reset_code.get_or_insert(error_code);
        debug!(stream_id = %self.id, error_code, final_size, "resetting stream");

        self.ctx
            .with_events(|events| events.request_reset_stream(self.id, error_code, final_size));
        self.writer_wakeup.notify_one();
        true
    }

    /// The peer sent STOP_SENDING (RFC 9000 Section 3.5).
    ///
    /// Answers with RESET_STREAM carrying the peer's error code. The writer
    /// then fails with [`Error::StopSending`].
    pub fn stop_sending_received(&self, error_code: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.stop_sending_code.is_some() {
                return;
            }
            inner.stop_sending_code = Some(error_code);
        }
        debug!(stream_id = %self.id, error_code, "peer stopped sending");
        if !self.reset(error_code) {
            self.writer_wakeup.notify_one();
        }
    }

    /// A STREAM frame carrying `[offset, offset + len)` was acknowledged.
    pub fn on_data_acknowledged(&self, offset: u64, len: u64, fin: bool) {
        let complete = {
            let mut inner = self.inner.lock();
            inner.acked.insert(offset, offset + len);
            if fin {
                inner.acked.fin_acked = true;
            }
            match self.queue.stream_size() {
                Some(size) => inner.acked.covers(size),
                None => false,
            }
        };
        if complete && self.state() == SendingState::DataSent {
            self.switch_to(SendingState::DataRecvd);
        }
    }

    /// Our RESET_STREAM was acknowledged.
    pub fn on_reset_acknowledged(&self) {
        self.switch_to(SendingState::ResetRecvd);
    }

    pub(crate) fn attach_writer(&self) {
        let mut inner = self.inner.lock();
        assert!(
            !inner.writer_attached,
            "stream {} already has a writer attached",
            self.id
        );
        inner.writer_attached = true;
    }

    pub(crate) fn detach_writer(&self) {
        self.inner.lock().writer_attached = false;
    }

    pub fn has_writer(&self) -> bool {
        self.inner.lock().writer_attached
    }

    /// Connection termination: drop unsent data and fail the writer.
    pub(crate) fn terminate(&self, reason: &str) {
        self.inner
            .lock()
            .closed
            .get_or_insert_with(|| reason.to_string());
        self.queue.close();
        self.writer_wakeup.notify_one();
    }
}
