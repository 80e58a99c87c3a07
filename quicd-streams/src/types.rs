//! # Core Stream Types (RFC 9000 Section 2.1, Section 16)
//!
//! Stream identifiers, the four stream type classes, endpoint side and the
//! variable-length integer sizing used for frame size accounting.

#![forbid(unsafe_code)]

use core::fmt;

// ============================================================================
// Variable-Length Integer Encoding (RFC 9000 Section 16)
// ============================================================================

/// Variable-Length Integer (RFC 9000 Section 16)
///
/// QUIC uses a variable-length encoding for integers. The first two bits
/// indicate the length: 00=1 byte, 01=2 bytes, 10=4 bytes, 11=8 bytes.
/// Maximum value: 2^62 - 1
pub type VarInt = u64;

/// Maximum value for VarInt (2^62 - 1)
pub const VARINT_MAX: u64 = (1u64 << 62) - 1;

/// VarInt sizing utilities
pub struct VarIntCodec;

impl VarIntCodec {
    /// Calculate the encoded size for a given value
    pub fn size(value: VarInt) -> usize {
        debug_assert!(value <= VARINT_MAX, "varint out of range: {}", value);
        if value < 0x40 {
            1
        } else if value < 0x4000 {
            2
        } else if value < 0x4000_0000 {
            4
        } else {
            8
        }
    }
}

// ============================================================================
// Stream ID (RFC 9000 Section 2.1)
// ============================================================================

/// Stream ID - Identifies a bidirectional or unidirectional stream
///
/// The two least significant bits encode stream type and initiator:
/// - Bit 0: Initiator (0=client, 1=server)
/// - Bit 1: Direction (0=bidirectional, 1=unidirectional)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Create a new StreamId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The type class this id belongs to
    pub fn stream_type(&self) -> StreamType {
        StreamType::from_stream_id(*self)
    }

    /// Check if this stream is bidirectional
    pub fn is_bidirectional(&self) -> bool {
        (self.0 & 0x02) == 0
    }

    /// Check if this stream is unidirectional
    pub fn is_unidirectional(&self) -> bool {
        (self.0 & 0x02) != 0
    }

    pub fn is_client_initiated(&self) -> bool {
        (self.0 & 0x01) == 0
    }

    pub fn is_server_initiated(&self) -> bool {
        (self.0 & 0x01) != 0
    }

    /// Which endpoint opened this stream
    pub fn initiator(&self) -> Side {
        if self.is_client_initiated() {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// True if the endpoint on `side` opened this stream
    pub fn is_local(&self, side: Side) -> bool {
        self.initiator() == side
    }

    /// Ordinal of this stream within its type class (0 for the first stream).
    pub fn index(&self) -> u64 {
        self.0 >> 2
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq<u64> for StreamId {
    fn eq(&self, other: &u64) -> bool {
        self.0 == *other
    }
}

/// Largest value a MAX_STREAMS or STREAMS_BLOCKED frame may carry (2^60).
pub const MAX_STREAMS_VALUE_LIMIT: u64 = 1 << 60;

/// Stream Type - Encodes directionality and initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamType {
    /// Client-initiated bidirectional stream
    ClientBidirectional = 0x00,
    /// Server-initiated bidirectional stream
    ServerBidirectional = 0x01,
    /// Client-initiated unidirectional stream
    ClientUnidirectional = 0x02,
    /// Server-initiated unidirectional stream
    ServerUnidirectional = 0x03,
}

impl StreamType {
    /// Extract stream type from stream ID
    pub fn from_stream_id(id: StreamId) -> Self {
        match id.0 & 0x03 {
            0x00 => StreamType::ClientBidirectional,
            0x01 => StreamType::ServerBidirectional,
            0x02 => StreamType::ClientUnidirectional,
            _ => StreamType::ServerUnidirectional,
        }
    }

    /// The type opened by `initiator` in `direction`
    pub fn new(initiator: Side, direction: StreamDirection) -> Self {
        match (initiator, direction) {
            (Side::Client, StreamDirection::Bidirectional) => StreamType::ClientBidirectional,
            (Side::Server, StreamDirection::Bidirectional) => StreamType::ServerBidirectional,
            (Side::Client, StreamDirection::Unidirectional) => StreamType::ClientUnidirectional,
            (Side::Server, StreamDirection::Unidirectional) => StreamType::ServerUnidirectional,
        }
    }

    /// Low two bits shared by every id of this type; also the first id.
    pub fn bits(self) -> u64 {
        self as u64
    }

    /// First stream id of this type
    pub fn first_id(self) -> StreamId {
        StreamId(self.bits())
    }

    /// Check if this stream type is bidirectional
    pub fn is_bidirectional(self) -> bool {
        matches!(
            self,
            StreamType::ClientBidirectional | StreamType::ServerBidirectional
        )
    }

    /// Check if this stream type is unidirectional
    pub fn is_unidirectional(self) -> bool {
        !self.is_bidirectional()
    }

    pub fn direction(self) -> StreamDirection {
        if self.is_bidirectional() {
            StreamDirection::Bidirectional
        } else {
            StreamDirection::Unidirectional
        }
    }

    /// Check if client initiated this stream type
    pub fn is_client_initiated(self) -> bool {
        matches!(
            self,
            StreamType::ClientBidirectional | StreamType::ClientUnidirectional
        )
    }

    pub fn initiator(self) -> Side {
        if self.is_client_initiated() {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// All four type classes, in id-bit order
    pub const ALL: [StreamType; 4] = [
        StreamType::ClientBidirectional,
        StreamType::ServerBidirectional,
        StreamType::ClientUnidirectional,
        StreamType::ServerUnidirectional,
    ];
}

/// Stream directionality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    Bidirectional,
    Unidirectional,
}

impl StreamDirection {
    pub fn is_bidirectional(self) -> bool {
        matches!(self, StreamDirection::Bidirectional)
    }

    pub(crate) fn index(self) -> usize {
        match self {
            StreamDirection::Bidirectional => 0,
            StreamDirection::Unidirectional => 1,
        }
    }
}

/// Stream Offset - Byte offset within a stream
pub type StreamOffset = u64;

// ============================================================================
// Side (Client vs Server)
// ============================================================================

/// Connection endpoint side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Client endpoint
    Client,
    /// Server endpoint
    Server,
}

impl Side {
    /// Check if this side is the client
    pub fn is_client(self) -> bool {
        matches!(self, Side::Client)
    }

    /// Check if this side is the server
    pub fn is_server(self) -> bool {
        matches!(self, Side::Server)
    }

    /// Get the opposite side
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}
