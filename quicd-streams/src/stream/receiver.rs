//! # Receiving Part of a Stream (RFC 9000 Section 3.2)
//!
//! Incoming STREAM frames are validated against flow control and the final
//! size *before* they touch the reordering buffer, so a peer cannot use
//! far-away offsets to get around the limits:
//!
//! 1. `offset + len` must not exceed the MAX_STREAM_DATA we granted
//!    (FLOW_CONTROL_ERROR).
//! 2. Data must agree with a known final size, and a FIN must not move it
//!    (FINAL_SIZE_ERROR).
//! 3. New bytes are charged to connection-level flow control.
//! 4. Only then is the data buffered, after which the fragmentation guard
//!    runs (PROTOCOL_VIOLATION).
//!
//! As the reader consumes data, the receive window is extended and
//! MAX_STREAM_DATA queued through the directory.

#![forbid(unsafe_code)]

use crate::error::{Error, Result, TransportError};
use crate::flow_control::ReceiveCredit;
use crate::frames::{StreamFrame, FRAME_TYPE_RESET_STREAM};
use crate::stream::buffer::ReceiveBuffer;
use crate::stream::reader::StreamChunk;
use crate::stream::state::{ReceivingState, StateCell, TerminalState, Transition};
use crate::stream::StreamContext;
use crate::types::StreamId;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Limits applied by the fragmentation guard.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FragmentLimits {
    pub(crate) max_fragments: usize,
    pub(crate) min_average_size: u64,
}

#[derive(Debug)]
struct ReceiverInner {
    buffer: ReceiveBuffer,
    credit: ReceiveCredit,
    final_size: Option<u64>,
    reset_code: Option<u64>,

    /// The reader sent STOP_SENDING; incoming data is discarded.
    stopped: bool,
    reader_attached: bool,
    closed: Option<String>,
}

/// The receiving half of a stream.
#[derive(Debug)]
pub struct ReceiverStream {
    id: StreamId,
    state: StateCell<ReceivingState>,
    inner: Mutex<ReceiverInner>,
    limits: FragmentLimits,
    reader_wakeup: Notify,
    ctx: StreamContext,
}

impl ReceiverStream {
    pub(crate) fn new(
        id: StreamId,
        initial_max_stream_data: u64,
        receive_window: u64,
        limits: FragmentLimits,
        ctx: StreamContext,
    ) -> Self {
        Self {
            id,
            state: StateCell::new(ReceivingState::Recv),
            inner: Mutex::new(ReceiverInner {
                buffer: ReceiveBuffer::new(),
                credit: ReceiveCredit::new(initial_max_stream_data, receive_window),
                final_size: None,
                reset_code: None,
                stopped: false,
                reader_attached: false,
                closed: None,
            }),
            limits,
            reader_wakeup: Notify::new(),
            ctx,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> ReceivingState {
        self.state.get()
    }

    /// Limit currently granted to the peer
    pub fn max_stream_data(&self) -> u64 {
        self.inner.lock().credit.max_stream_data()
    }

    /// Final size, once known
    pub fn final_size(&self) -> Option<u64> {
        self.inner.lock().final_size
    }

    /// Bytes ready for the reader
    pub fn readable(&self) -> u64 {
        self.inner.lock().buffer.readable()
    }

    fn switch_to(&self, to: ReceivingState) -> bool {
        let transition = self.state.switch_to(to);
        if let Transition::Switched { from } = transition {
            trace!(stream_id = %self.id, ?from, ?to, "receiving state");
            if to.is_terminal() {
                self.ctx
                    .terminal_state(self.id, TerminalState::Receiving(to));
            }
        }
        transition.switched()
    }

    fn fault(&self, code: TransportError, frame_type: u64, reason: String) -> Error {
        warn!(stream_id = %self.id, ?code, %reason, "stream protocol fault");
        Error::transport(code, frame_type, reason)
    }

    /// Process an incoming STREAM frame.
    pub fn on_stream_frame(&self, frame: &StreamFrame) -> Result<()> {
        let frame_type = frame.frame_type();
        let end = frame.end_offset();

        let mut inner = self.inner.lock();

        if let Some(final_size) = inner.final_size {
            if end > final_size || (frame.fin && end != final_size) {
                return Err(self.fault(
                    TransportError::FinalSizeError,
                    frame_type,
                    format!("data ends at {} but final size is {}", end, final_size),
                ));
            }
        } else if frame.fin && end < inner.credit.received() {
            return Err(self.fault(
                TransportError::FinalSizeError,
                frame_type,
                format!(
                    "final size {} below received data {}",
                    end,
                    inner.credit.received()
                ),
            ));
        }

        if !inner.credit.permits(end) {
            return Err(self.fault(
                TransportError::FlowControlError,
                frame_type,
                format!(
                    "data ends at {} beyond MAX_STREAM_DATA {}",
                    end,
                    inner.credit.max_stream_data()
                ),
            ));
        }

        let new_bytes = end.saturating_sub(inner.credit.received());
        if new_bytes > 0 {
            self.ctx
                .connection
                .increase_received_data(new_bytes, frame_type)?;
            inner.credit.on_received(end);
        }

        let state = self.state();
        if !state.is_receiving() || inner.closed.is_some() {
            // Reset or complete: still accounted, never delivered
            return Ok(());
        }

        if frame.fin && inner.final_size.is_none() {
            inner.final_size = Some(end);
            self.switch_to(ReceivingState::SizeKnown);
        }

        let released = inner.buffer.insert(frame.offset, frame.data.clone());
        if inner
            .buffer
            .is_excessively_fragmented(self.limits.max_fragments, self.limits.min_average_size)
        {
            let fragments = inner.buffer.pending_fragments();
            return Err(self.fault(
                TransportError::ProtocolViolation,
                frame_type,
                format!("excessive fragmentation: {} out-of-order fragments", fragments),
            ));
        }

        let all_received = inner.final_size == Some(inner.buffer.contiguous_offset());
        if all_received {
            self.switch_to(ReceivingState::DataRecvd);
        }

        if inner.stopped {
            let discarded = inner.buffer.discard_readable();
            inner.credit.on_discarded(discarded);
            drop(inner);
            if discarded > 0 {
                self.ctx.connection.increase_processed_data(discarded);
            }
            if all_received {
                self.switch_to(ReceivingState::DataRead);
            }
            return Ok(());
        }
        drop(inner);

        if released > 0 || all_received {
            self.reader_wakeup.notify_one();
        }
        Ok(())
    }

    /// Process an incoming RESET_STREAM (RFC 9000 Section 3.2).
    pub fn on_reset(&self, error_code: u64, final_size: u64) -> Result<()> {
        let frame_type = FRAME_TYPE_RESET_STREAM;
        let mut inner = self.inner.lock();

        if let Some(known) = inner.final_size {
            if known != final_size {
                return Err(self.fault(
                    TransportError::FinalSizeError,
                    frame_type,
                    format!("reset final size {} contradicts {}", final_size, known),
                ));
            }
        }
        if final_size < inner.credit.received() {
            return Err(self.fault(
                TransportError::FinalSizeError,
                frame_type,
                format!(
                    "reset final size {} below received data {}",
                    final_size,
                    inner.credit.received()
                ),
            ));
        }
        if !inner.credit.permits(final_size) {
            return Err(self.fault(
                TransportError::FlowControlError,
                frame_type,
                format!(
                    "reset final size {} beyond MAX_STREAM_DATA {}",
                    final_size,
                    inner.credit.max_stream_data()
                ),
            ));
        }

        let new_bytes = final_size - inner.credit.received();
        if new_bytes > 0 {
            self.ctx
                .connection
                .increase_received_data(new_bytes, frame_type)?;
            inner.credit.on_received(final_size);
        }
        inner.final_size = Some(final_size);

        if !self.switch_to(ReceivingState::ResetRecvd) {
            return Ok(());
        }
        debug!(stream_id = %self.id, error_code, final_size, "stream reset by peer");

        // Everything up to the final size now counts as consumed
        inner.buffer.clear();
        inner.reset_code = Some(error_code);
        let processed = final_size - inner.credit.processed();
        inner.credit.on_discarded(processed);
        let nobody_reading = !inner.reader_attached || inner.stopped;
        drop(inner);

        if processed > 0 {
            self.ctx.connection.increase_processed_data(processed);
        }
        if nobody_reading {
            self.switch_to(ReceivingState::ResetRead);
        }
        self.reader_wakeup.notify_one();
        Ok(())
    }

    /// The peer reported STREAM_DATA_BLOCKED.
    pub fn on_data_blocked(&self) {
        if self.state() != ReceivingState::Recv {
            return;
        }
        let max_stream_data = {
            let mut inner = self.inner.lock();
            // No more credit once we asked the peer to stop
            if inner.stopped {
                return;
            }
            inner.credit.on_data_blocked()
        };
        self.ctx.with_events(|events| {
            events.request_send_max_stream_data(self.id, max_stream_data)
        });
    }

    /// Take the next chunk for the reader.
    ///
    /// `Ok(None)` means nothing is available yet.
    pub fn poll_read(&self) -> Result<Option<StreamChunk>> {
        let mut inner = self.inner.lock();

        if let Some(data) = inner.buffer.read_chunk() {
            let len = data.len() as u64;
            let extended = inner.credit.on_consumed(len);
            drop(inner);

            self.ctx.connection.increase_processed_data(len);
            if let Some(max_stream_data) = extended {
                if self.state() == ReceivingState::Recv {
                    trace!(stream_id = %self.id, max_stream_data, "extending stream credit");
                    self.ctx.with_events(|events| {
                        events.request_send_max_stream_data(self.id, max_stream_data)
                    });
                }
            }
            return Ok(Some(StreamChunk::Data(data)));
        }

        match self.state() {
            ReceivingState::DataRecvd => {
                drop(inner);
                self.switch_to(ReceivingState::DataRead);
                Ok(Some(StreamChunk::Fin))
            }
            ReceivingState::DataRead => Ok(Some(StreamChunk::Fin)),
            ReceivingState::ResetRecvd | ReceivingState::ResetRead => {
                let error_code = inner.reset_code.unwrap_or_default();
                drop(inner);
                self.switch_to(ReceivingState::ResetRead);
                Err(Error::StreamReset {
                    stream_id: self.id,
                    error_code,
                })
            }
            ReceivingState::Recv | ReceivingState::SizeKnown => match &inner.closed {
                Some(reason) => Err(Error::connection_closed(reason.clone())),
                None => Ok(None),
            },
        }
    }

    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.reader_wakeup.notified()
    }

    /// Ask the peer to stop sending (RFC 9000 Section 3.5).
    ///
    /// Buffered and future data is discarded but still accounted against
    /// flow control until the peer resets the stream.
    pub fn stop_sending(&self, error_code: u64) {
        if !self.state().is_receiving() {
            return;
        }
        let discarded = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            let discarded = inner.buffer.discard_readable();
            inner.credit.on_discarded(discarded);
            discarded
        };
        debug!(stream_id = %self.id, error_code, "stop sending");

        if discarded > 0 {
            self.ctx.connection.increase_processed_data(discarded);
        }
        self.ctx
            .with_events(|events| events.schedule_stop_sending(self.id, error_code));
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    pub(crate) fn attach_reader(&self) {
        let mut inner = self.inner.lock();
        assert!(
            !inner.reader_attached,
            "stream {} already has a reader attached",
            self.id
        );
        inner.reader_attached = true;
    }

    pub(crate) fn detach_reader(&self) {
        self.inner.lock().reader_attached = false;
        // A reset nobody will read
        if self.state() == ReceivingState::ResetRecvd {
            self.switch_to(ReceivingState::ResetRead);
        }
    }

    pub fn has_reader(&self) -> bool {
        self.inner.lock().reader_attached
    }

    /// Connection termination: fail the reader.
    pub(crate) fn terminate(&self, reason: &str) {
        {
            let mut inner = self.inner.lock();
            inner.closed.get_or_insert_with(|| reason.to_string());
            inner.buffer.clear();
        }
        self.reader_wakeup.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::tests::{Event, Harness};
    use bytes::Bytes;

    const LIMITS: FragmentLimits = FragmentLimits {
        max_fragments: 4,
        min_average_size: 8,
    };

    fn new_receiver(harness: &Harness, max_stream_data: u64) -> ReceiverStream {
        ReceiverStream::new(StreamId(1), max_stream_data, max_stream_data, LIMITS, harness.context())
    }

    fn frame(offset: u64, data: &'static [u8], fin: bool) -> StreamFrame {
        StreamFrame::new(StreamId(1), offset, Bytes::from_static(data), fin)
    }

    fn read_all(receiver: &ReceiverStream) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        loop {
            match receiver.poll_read().unwrap() {
                Some(StreamChunk::Data(data)) => out.extend_from_slice(&data),
                Some(StreamChunk::Fin) => return (out, true),
                None => return (out, false),
            }
        }
    }

    #[test]
    fn test_out_of_order_delivered_in_order() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 1000);
        receiver.on_stream_frame(&frame(10, b"klmno", false)).unwrap();
        assert_eq!(receiver.readable(), 0);
        receiver.on_stream_frame(&frame(0, b"abcdefghij", false)).unwrap();

        let (data, fin) = read_all(&receiver);
        assert_eq!(data, b"abcdefghijklmno");
        assert!(!fin);
        assert_eq!(harness.received_data(), 15);
        assert_eq!(harness.processed_data(), 15);
    }

    #[test]
    fn test_fin_and_data_read() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 1000);
        receiver.on_stream_frame(&frame(5, b"world", true)).unwrap();
        assert_eq!(receiver.state(), ReceivingState::SizeKnown);
        receiver.on_stream_frame(&frame(0, b"hello", false)).unwrap();
        assert_eq!(receiver.state(), ReceivingState::DataRecvd);

        let (data, fin) = read_all(&receiver);
        assert_eq!(data, b"helloworld");
        assert!(fin);
        assert_eq!(receiver.state(), ReceivingState::DataRead);
        assert!(harness.events().contains(&Event::Terminal(
            StreamId(1),
            TerminalState::Receiving(ReceivingState::DataRead)
        )));
    }

    #[test]
    fn test_flow_control_violation_rejected_before_buffering() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 10);
        let err = receiver
            .on_stream_frame(&frame(5, b"abcdef", false))
            .unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::FlowControlError));
        assert_eq!(receiver.readable(), 0);
        assert_eq!(harness.received_data(), 0);
    }

    #[test]
    fn test_final_size_violations() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 1000);
        receiver.on_stream_frame(&frame(0, b"abcdef", true)).unwrap();

        // Beyond the final size
        let err = receiver.on_stream_frame(&frame(4, b"xyz", false)).unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::FinalSizeError));

        // A second FIN at a different offset
        let err = receiver.on_stream_frame(&frame(0, b"abc", true)).unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::FinalSizeError));

        // Repeating the same FIN is fine
        receiver.on_stream_frame(&frame(3, b"def", true)).unwrap();

        let other = new_receiver(&harness, 1000);
        other.on_stream_frame(&frame(0, b"abcdef", false)).unwrap();
        let err = other.on_stream_frame(&frame(0, b"abc", true)).unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::FinalSizeError));
    }

    #[test]
    fn test_excessive_fragmentation() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 1000);
        for i in 0..4u64 {
            receiver.on_stream_frame(&frame(10 + i * 10, b"x", false)).unwrap();
        }
        let err = receiver.on_stream_frame(&frame(100, b"x", false)).unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::ProtocolViolation));
    }

    #[test]
    fn test_reset_discards_buffered_data() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 1000);
        receiver.attach_reader();
        receiver.on_stream_frame(&frame(0, b"abcdef", false)).unwrap();
        receiver.on_reset(77, 20).unwrap();
        assert_eq!(receiver.state(), ReceivingState::ResetRecvd);
        assert_eq!(receiver.readable(), 0);
        assert_eq!(harness.received_data(), 20);
        assert_eq!(harness.processed_data(), 20);

        let err = receiver.poll_read().unwrap_err();
        assert_eq!(
            err,
            Error::StreamReset {
                stream_id: StreamId(1),
                error_code: 77
            }
        );
        assert_eq!(receiver.state(), ReceivingState::ResetRead);

        // Late data is accounted but ignored
        receiver.on_stream_frame(&frame(6, b"gh", false)).unwrap();
        assert_eq!(receiver.readable(), 0);
    }

    #[test]
    fn test_reset_without_reader_is_read_immediately() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 1000);
        receiver.on_reset(1, 0).unwrap();
        assert_eq!(receiver.state(), ReceivingState::ResetRead);
    }

    #[test]
    fn test_reset_final_size_checks() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 100);
        receiver.on_stream_frame(&frame(0, b"abcdef", false)).unwrap();

        let err = receiver.on_reset(0, 3).unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::FinalSizeError));

        let err = receiver.on_reset(0, 101).unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::FlowControlError));
    }

    #[test]
    fn test_reading_extends_credit() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 16);
        receiver.on_stream_frame(&frame(0, b"0123456789", false)).unwrap();
        read_all(&receiver);
        // 16 - 10 = 6 < 8: extend to 10 + 16
        assert_eq!(receiver.max_stream_data(), 26);
        assert!(harness
            .events()
            .contains(&Event::MaxStreamData(StreamId(1), 26)));
    }

    #[test]
    fn test_stop_sending_discards() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 1000);
        receiver.on_stream_frame(&frame(0, b"abc", false)).unwrap();
        receiver.stop_sending(5);
        assert!(harness.events().contains(&Event::StopSending(StreamId(1), 5)));
        assert_eq!(receiver.readable(), 0);

        receiver.on_stream_frame(&frame(3, b"def", true)).unwrap();
        assert_eq!(receiver.readable(), 0);
        assert_eq!(harness.processed_data(), 6);
        assert_eq!(receiver.state(), ReceivingState::DataRead);
    }

    #[test]
    fn test_stop_sending_keeps_granted_limit() {
        let harness = Harness::new(false);
        let receiver = new_receiver(&harness, 16);
        receiver.on_stream_frame(&frame(0, b"0123456789", false)).unwrap();
        receiver.stop_sending(5);
        assert_eq!(receiver.max_stream_data(), 16);

        // Data blocked after stopping grants nothing either
        receiver.on_data_blocked();
        assert_eq!(receiver.max_stream_data(), 16);
        assert!(!harness
            .events()
            .iter()
            .any(|e| matches!(e, Event::MaxStreamData(..))));

        // Ends at 20, beyond the 16 the peer was given
        let err = receiver
            .on_stream_frame(&frame(10, b"abcdefghij", false))
            .unwrap_err();
        assert_eq!(err.transport_error(), Some(TransportError::FlowControlError));
        receiver.on_stream_frame(&frame(10, b"abcdef", true)).unwrap();
        assert_eq!(harness.processed_data(), 16);
    }
}
