//! QUIC Stream Error Types
//!
//! RFC 9000 Section 20 defines the transport error codes a stream layer can
//! raise against a misbehaving peer. Those are fatal to the connection. The
//! remaining variants are surfaced to the application on a single stream and
//! leave the rest of the connection untouched.

#![forbid(unsafe_code)]

use crate::types::StreamId;
use core::time::Duration;
use thiserror::Error;

/// Transport Error Codes as defined in RFC 9000 Section 20.1
///
/// These errors trigger immediate connection closure and are sent in
/// CONNECTION_CLOSE frames of type 0x1c.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum TransportError {
    /// No error (0x00) - Used for graceful shutdown
    NoError = 0x00,

    /// Internal Error (0x01) - Implementation error
    InternalError = 0x01,

    /// Flow Control Error (0x03) - Peer exceeded flow control limits
    FlowControlError = 0x03,

    /// Stream Limit Error (0x04) - Stream limit exceeded
    StreamLimitError = 0x04,

    /// Stream State Error (0x05) - Frame received in invalid stream state
    StreamStateError = 0x05,

    /// Final Size Error (0x06) - Final size violation
    FinalSizeError = 0x06,

    /// Frame Encoding Error (0x07) - Frame encoding error
    FrameEncodingError = 0x07,

    /// Transport Parameter Error (0x08) - Invalid transport parameters
    TransportParameterError = 0x08,

    /// Protocol Violation (0x0a) - Generic protocol violation
    ProtocolViolation = 0x0a,
}

impl TransportError {
    /// Wire value carried in CONNECTION_CLOSE.
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// Generic Result Type for stream operations
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised by the stream layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer violated the protocol. Fatal to the connection.
    #[error("{reason} ({code:?}, frame type {frame_type:#x})")]
    Transport {
        code: TransportError,
        /// Type of the frame that triggered the fault.
        frame_type: u64,
        reason: String,
    },

    /// Reading from a stream the peer reset, or writing to a stream that
    /// was reset locally.
    #[error("stream {stream_id} reset with error code {error_code}")]
    StreamReset { stream_id: StreamId, error_code: u64 },

    /// Writing to a stream after the peer sent STOP_SENDING.
    #[error("peer stopped sending on stream {stream_id} with error code {error_code}")]
    StopSending { stream_id: StreamId, error_code: u64 },

    /// The stream half has already been finished.
    #[error("stream {0} is closed")]
    StreamClosed(StreamId),

    /// The connection was terminated.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// A stream creation permit was not granted in time.
    #[error("stream limit not increased within {timeout:?}")]
    StreamLimit { timeout: Duration },
}

impl Error {
    /// Build a protocol fault.
    pub fn transport(code: TransportError, frame_type: u64, reason: impl Into<String>) -> Self {
        Error::Transport {
            code,
            frame_type,
            reason: reason.into(),
        }
    }

    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Error::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// The transport error code, if this is a protocol fault.
    pub fn transport_error(&self) -> Option<TransportError> {
        match self {
            Error::Transport { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True if the connection must be closed because of this error.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }
}

impl From<TransportError> for Error {
    fn from(code: TransportError) -> Self {
        Error::transport(code, 0, format!("{:?}", code))
    }
}
