//! # Stream Frame Types (RFC 9000 Section 19)
//!
//! The frames produced and consumed by the stream layer. Encoding itself is
//! done by the packet layer; what matters here is the exact encoded size of
//! each frame, since the scheduler fills packets under a byte budget.
//!
//! STREAM frames are always sized with the LEN bit set so several frames can
//! share one packet. The OFF bit is only set for a non-zero offset.

#![forbid(unsafe_code)]

use crate::types::{StreamId, StreamOffset, VarInt, VarIntCodec};
use bytes::Bytes;

/// Frame Type Constants (RFC 9000 Section 19)
pub const FRAME_TYPE_RESET_STREAM: u64 = 0x04;
pub const FRAME_TYPE_STOP_SENDING: u64 = 0x05;
pub const FRAME_TYPE_STREAM_BASE: u64 = 0x08; // 0x08-0x0f
pub const FRAME_TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_TYPE_MAX_STREAMS_BIDI: u64 = 0x12;
pub const FRAME_TYPE_MAX_STREAMS_UNI: u64 = 0x13;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const FRAME_TYPE_STREAMS_BLOCKED_BIDI: u64 = 0x16;
pub const FRAME_TYPE_STREAMS_BLOCKED_UNI: u64 = 0x17;

/// STREAM Frame Flag Bits (RFC 9000 Section 19.8)
///
/// - Bit 0 (FIN): Last frame in stream
/// - Bit 1 (LEN): Length field present
/// - Bit 2 (OFF): Offset field present
pub const STREAM_FRAME_BIT_FIN: u64 = 0x01;
pub const STREAM_FRAME_BIT_LEN: u64 = 0x02;
pub const STREAM_FRAME_BIT_OFF: u64 = 0x04;

/// STREAM Frame (RFC 9000 Section 19.8)
///
/// Carries application data on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,

    /// Byte offset in stream
    pub offset: StreamOffset,

    /// Stream data
    pub data: Bytes,

    /// FIN bit: indicates final frame in stream
    pub fin: bool,
}

impl StreamFrame {
    pub fn new(stream_id: StreamId, offset: StreamOffset, data: Bytes, fin: bool) -> Self {
        Self {
            stream_id,
            offset,
            data,
            fin,
        }
    }

    /// Type byte with the OFF/LEN/FIN bits this frame encodes with
    pub fn frame_type(&self) -> u64 {
        let mut ty = FRAME_TYPE_STREAM_BASE | STREAM_FRAME_BIT_LEN;
        if self.offset > 0 {
            ty |= STREAM_FRAME_BIT_OFF;
        }
        if self.fin {
            ty |= STREAM_FRAME_BIT_FIN;
        }
        ty
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte carried
    pub fn end_offset(&self) -> StreamOffset {
        self.offset + self.data.len() as u64
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        Self::header_size(self.stream_id, self.offset, self.data.len()) + self.data.len()
    }

    fn fixed_header_size(stream_id: StreamId, offset: StreamOffset) -> usize {
        let offset_len = if offset > 0 {
            VarIntCodec::size(offset)
        } else {
            0
        };
        1 + VarIntCodec::size(stream_id.value()) + offset_len
    }

    /// Size of everything but the payload
    pub fn header_size(stream_id: StreamId, offset: StreamOffset, length: usize) -> usize {
        Self::fixed_header_size(stream_id, offset) + VarIntCodec::size(length as u64)
    }

    /// Largest payload that fits in `available` bytes once the header is
    /// accounted for, or `None` if not even an empty frame fits.
    pub fn payload_capacity(
        stream_id: StreamId,
        offset: StreamOffset,
        available: usize,
    ) -> Option<usize> {
        let fixed = Self::fixed_header_size(stream_id, offset);
        if available <= fixed {
            return None;
        }
        let rest = available - fixed;
        let mut len = rest - VarIntCodec::size(rest as u64);
        while len + 1 + VarIntCodec::size(len as u64 + 1) <= rest {
            len += 1;
        }
        Some(len)
    }
}

/// RESET_STREAM Frame (RFC 9000 Section 19.4)
///
/// Abruptly terminates sending on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetStreamFrame {
    pub stream_id: StreamId,

    /// Application-defined error code
    pub error_code: VarInt,

    /// Final size of the stream in bytes
    pub final_size: VarInt,
}

impl ResetStreamFrame {
    pub fn size(&self) -> usize {
        1 + VarIntCodec::size(self.stream_id.value())
            + VarIntCodec::size(self.error_code)
            + VarIntCodec::size(self.final_size)
    }
}

/// STOP_SENDING Frame (RFC 9000 Section 19.5)
///
/// Requests peer to stop sending on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSendingFrame {
    pub stream_id: StreamId,

    /// Application-defined error code
    pub error_code: VarInt,
}

impl StopSendingFrame {
    pub fn size(&self) -> usize {
        1 + VarIntCodec::size(self.stream_id.value()) + VarIntCodec::size(self.error_code)
    }
}

/// MAX_STREAM_DATA Frame (RFC 9000 Section 19.10)
///
/// Informs peer of maximum data bytes it can send on a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamDataFrame {
    pub stream_id: StreamId,

    /// Maximum stream data in bytes
    pub maximum_stream_data: VarInt,
}

impl MaxStreamDataFrame {
    pub fn size(&self) -> usize {
        1 + VarIntCodec::size(self.stream_id.value()) + VarIntCodec::size(self.maximum_stream_data)
    }
}

/// MAX_STREAMS Frame (RFC 9000 Section 19.11)
///
/// Informs peer of maximum number of streams it can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxStreamsFrame {
    /// Maximum number of streams
    pub maximum_streams: VarInt,

    /// True for bidirectional, false for unidirectional
    pub bidirectional: bool,
}

impl MaxStreamsFrame {
    pub fn frame_type(&self) -> u64 {
        if self.bidirectional {
            FRAME_TYPE_MAX_STREAMS_BIDI
        } else {
            FRAME_TYPE_MAX_STREAMS_UNI
        }
    }

    pub fn size(&self) -> usize {
        1 + VarIntCodec::size(self.maximum_streams)
    }
}

/// STREAM_DATA_BLOCKED Frame (RFC 9000 Section 19.13)
///
/// Indicates sender is blocked by stream-level flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDataBlockedFrame {
    pub stream_id: StreamId,

    /// Stream data limit at which blocking occurred
    pub stream_data_limit: VarInt,
}

impl StreamDataBlockedFrame {
    pub fn size(&self) -> usize {
        1 + VarIntCodec::size(self.stream_id.value()) + VarIntCodec::size(self.stream_data_limit)
    }
}

/// STREAMS_BLOCKED Frame (RFC 9000 Section 19.14)
///
/// Indicates sender is blocked from opening streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamsBlockedFrame {
    /// Stream count limit at which blocking occurred
    pub stream_limit: VarInt,

    /// True for bidirectional, false for unidirectional
    pub bidirectional: bool,
}

impl StreamsBlockedFrame {
    pub fn frame_type(&self) -> u64 {
        if self.bidirectional {
            FRAME_TYPE_STREAMS_BLOCKED_BIDI
        } else {
            FRAME_TYPE_STREAMS_BLOCKED_UNI
        }
    }

    pub fn size(&self) -> usize {
        1 + VarIntCodec::size(self.stream_limit)
    }
}

/// Frames emitted by the stream scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// RESET_STREAM frame (0x04)
    ResetStream(ResetStreamFrame),

    /// STOP_SENDING frame (0x05)
    StopSending(StopSendingFrame),

    /// STREAM frame (0x08-0x0f)
    Stream(StreamFrame),

    /// MAX_STREAM_DATA frame (0x11)
    MaxStreamData(MaxStreamDataFrame),

    /// MAX_STREAMS frame (0x12 or 0x13)
    MaxStreams(MaxStreamsFrame),

    /// STREAM_DATA_BLOCKED frame (0x15)
    StreamDataBlocked(StreamDataBlockedFrame),

    /// STREAMS_BLOCKED frame (0x16 or 0x17)
    StreamsBlocked(StreamsBlockedFrame),
}

impl Frame {
    pub fn frame_type(&self) -> u64 {
        match self {
            Frame::ResetStream(_) => FRAME_TYPE_RESET_STREAM,
            Frame::StopSending(_) => FRAME_TYPE_STOP_SENDING,
            Frame::Stream(f) => f.frame_type(),
            Frame::MaxStreamData(_) => FRAME_TYPE_MAX_STREAM_DATA,
            Frame::MaxStreams(f) => f.frame_type(),
            Frame::StreamDataBlocked(_) => FRAME_TYPE_STREAM_DATA_BLOCKED,
            Frame::StreamsBlocked(f) => f.frame_type(),
        }
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        match self {
            Frame::ResetStream(f) => f.size(),
            Frame::StopSending(f) => f.size(),
            Frame::Stream(f) => f.size(),
            Frame::MaxStreamData(f) => f.size(),
            Frame::MaxStreams(f) => f.size(),
            Frame::StreamDataBlocked(f) => f.size(),
            Frame::StreamsBlocked(f) => f.size(),
        }
    }

    /// Stream this frame refers to, if any
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Frame::ResetStream(f) => Some(f.stream_id),
            Frame::StopSending(f) => Some(f.stream_id),
            Frame::Stream(f) => Some(f.stream_id),
            Frame::MaxStreamData(f) => Some(f.stream_id),
            Frame::StreamDataBlocked(f) => Some(f.stream_id),
            Frame::MaxStreams(_) | Frame::StreamsBlocked(_) => None,
        }
    }

    /// Flow-controlled payload bytes carried
    pub fn payload_len(&self) -> usize {
        match self {
            Frame::Stream(f) => f.len(),
            _ => 0,
        }
    }
}
