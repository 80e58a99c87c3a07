//! # Streams (RFC 9000 Sections 2-4)
//!
//! A stream is one or two halves sharing an id:
//!
//! - locally opened unidirectional: a [`SenderStream`] only
//! - remotely opened unidirectional: a [`ReceiverStream`] only
//! - bidirectional: both, wrapped in a [`BidiStream`]
//!
//! Halves are shared between the application (through [`StreamWriter`] and
//! [`StreamReader`]) and the packet assembler (through
//! [`ConnectionStreams`]), so each one is an `Arc` with its own small lock.
//! Halves report back to the directory through [`StreamEvents`], held as a
//! `Weak` to avoid a reference cycle.

pub mod buffer;
pub mod manager;
pub mod permit;
pub mod reader;
pub mod receiver;
pub mod scheduler;
pub mod sender;
pub mod state;
pub mod writer;


pub use buffer::ReceiveBuffer;
pub use manager::{ConnectionStreams, ListenerId, StreamListener};
pub use permit::StreamCreationPermit;
pub use reader::{StreamChunk, StreamReader};
pub use receiver::ReceiverStream;
pub use sender::SenderStream;
pub use state::{BidiState, ReceivingState, SendingState, TerminalState};
pub use writer::StreamWriter;

pub use crate::types::StreamId;

use crate::connection::Connection;
use core::fmt;
use std::sync::{Arc, Weak};

/// Notifications from stream halves to the directory that owns them.
///
/// Called without any stream lock held.
pub(crate) trait StreamEvents: Send + Sync {
    /// The sender has data (or a FIN) the packet assembler can take.
    fn data_available(&self, sender: &Arc<SenderStream>);

    /// A half reached a terminal state for the first time.
    fn terminal_state(&self, stream_id: StreamId, state: TerminalState);

    /// Queue RESET_STREAM.
    fn request_reset_stream(&self, stream_id: StreamId, error_code: u64, final_size: u64);

    /// Queue STOP_SENDING.
    fn schedule_stop_sending(&self, stream_id: StreamId, error_code: u64);

    /// Queue MAX_STREAM_DATA.
    fn request_send_max_stream_data(&self, stream_id: StreamId, max_stream_data: u64);
}

/// Collaborators shared by every half of one connection.
#[derive(Clone)]
pub(crate) struct StreamContext {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) events: Weak<dyn StreamEvents>,
}

impl StreamContext {
    pub(crate) fn new(connection: Arc<dyn Connection>, events: Weak<dyn StreamEvents>) -> Self {
        Self { connection, events }
    }

    /// Run `f` against the directory if it is still alive.
    pub(crate) fn with_events(&self, f: impl FnOnce(&dyn StreamEvents)) {
        if let Some(events) = self.events.upgrade() {
            f(events.as_ref());
        }
    }

    /// Report a first transition into a terminal state.
    pub(crate) fn terminal_state(&self, stream_id: StreamId, state: TerminalState) {
        tracing::debug!(stream_id = %stream_id, state = %state, "stream half terminal");
        self.connection.notify_terminal_state(stream_id, state);
        self.with_events(|events| events.terminal_state(stream_id, state));
    }
}

impl fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamContext")
            .field("is_client", &self.connection.is_client_connection())
            .finish_non_exhaustive()
    }
}

/// Which halves a stream has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

/// Both halves of a bidirectional stream.
#[derive(Debug)]
pub struct BidiStream {
    sender: Arc<SenderStream>,
    receiver: Arc<ReceiverStream>,
}

impl BidiStream {
    pub(crate) fn new(sender: Arc<SenderStream>, receiver: Arc<ReceiverStream>) -> Self {
        debug_assert_eq!(sender.id(), receiver.id());
        Self { sender, receiver }
    }

    pub fn id(&self) -> StreamId {
        self.sender.id()
    }

    pub fn sender(&self) -> &Arc<SenderStream> {
        &self.sender
    }

    pub fn receiver(&self) -> &Arc<ReceiverStream> {
        &self.receiver
    }

    /// Composite state (RFC 9000 Section 3.4)
    pub fn state(&self) -> BidiState {
        BidiState::derive(self.sender.state(), self.receiver.state())
    }
}

/// A stream registered in the directory.
#[derive(Debug, Clone)]
pub enum QuicStream {
    Send(Arc<SenderStream>),
    Recv(Arc<ReceiverStream>),
    Bidi(Arc<BidiStream>),
}

impl QuicStream {
    pub fn id(&self) -> StreamId {
        match self {
            QuicStream::Send(s) => s.id(),
            QuicStream::Recv(r) => r.id(),
            QuicStream::Bidi(b) => b.id(),
        }
    }

    pub fn mode(&self) -> StreamMode {
        match self {
            QuicStream::Send(_) => StreamMode::WriteOnly,
            QuicStream::Recv(_) => StreamMode::ReadOnly,
            QuicStream::Bidi(_) => StreamMode::ReadWrite,
        }
    }

    pub fn sender(&self) -> Option<&Arc<SenderStream>> {
        match self {
            QuicStream::Send(s) => Some(s),
            QuicStream::Bidi(b) => Some(b.sender()),
            QuicStream::Recv(_) => None,
        }
    }

    pub fn receiver(&self) -> Option<&Arc<ReceiverStream>> {
        match self {
            QuicStream::Recv(r) => Some(r),
            QuicStream::Bidi(b) => Some(b.receiver()),
            QuicStream::Send(_) => None,
        }
    }

    pub fn sending_state(&self) -> Option<SendingState> {
        self.sender().map(|s| s.state())
    }

    pub fn receiving_state(&self) -> Option<ReceivingState> {
        self.receiver().map(|r| r.state())
    }

    /// Composite state of a bidirectional stream.
    pub fn bidi_state(&self) -> Option<BidiState> {
        match self {
            QuicStream::Bidi(b) => Some(b.state()),
            _ => None,
        }
    }

    /// True once every half the stream has is terminal.
    pub fn is_terminal(&self) -> bool {
        self.sending_state().map_or(true, |s| s.is_terminal())
            && self.receiving_state().map_or(true, |r| r.is_terminal())
    }

    /// Attach the application writer.
    ///
    /// # Panics
    ///
    /// If the stream has no sending half or a writer is already attached.
    pub fn writer(&self) -> StreamWriter {
        match self.sender() {
            Some(sender) => StreamWriter::attach(sender.clone()),
            None => panic!("stream {} is receive-only", self.id()),
        }
    }

    /// Attach the application reader.
    ///
    /// # Panics
    ///
    /// If the stream has no receiving half or a reader is already attached.
    pub fn reader(&self) -> StreamReader {
        match self.receiver() {
            Some(receiver) => StreamReader::attach(receiver.clone()),
            None => panic!("stream {} is send-only", self.id()),
        }
    }

    /// Wake all attached handles with a connection-closed error.
    pub(crate) fn terminate(&self, reason: &str) {
        if let Some(sender) = self.sender() {
            sender.terminate(reason);
        }
        if let Some(receiver) = self.receiver() {
            receiver.terminate(reason);
        }
    }
}
