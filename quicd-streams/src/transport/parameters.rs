//! # Transport Parameters (RFC 9000 Section 18)
//!
//! Only the parameters that govern streams are modelled here: the initial
//! per-stream credit for each of the three stream roles and the initial
//! stream-count limits. Encoding and the remaining parameters belong to the
//! handshake layer.
//!
//! ## Which value applies where (RFC 9000 Section 18.2)
//!
//! - `initial_max_stream_data_bidi_local`: credit for bidirectional streams
//!   opened by the endpoint that sent the parameter.
//! - `initial_max_stream_data_bidi_remote`: credit for bidirectional streams
//!   opened by the receiver of the parameter.
//! - `initial_max_stream_data_uni`: credit for unidirectional streams opened
//!   by the receiver of the parameter.

use crate::error::*;
use crate::types::*;

/// Transport Parameter ID (RFC 9000 Section 18.2)
pub type TransportParameterId = VarInt;

// Transport Parameter IDs
pub const TP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: TransportParameterId = 0x05;
pub const TP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: TransportParameterId = 0x06;
pub const TP_INITIAL_MAX_STREAM_DATA_UNI: TransportParameterId = 0x07;
pub const TP_INITIAL_MAX_STREAMS_BIDI: TransportParameterId = 0x08;
pub const TP_INITIAL_MAX_STREAMS_UNI: TransportParameterId = 0x09;

/// Stream-related transport parameters.
///
/// Absent parameters default to zero, as RFC 9000 requires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportParameters {
    // Flow Control
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,

    // Stream Limits
    pub initial_max_streams_bidi: VarInt,
    pub initial_max_streams_uni: VarInt,
}

impl TransportParameters {
    /// Validate transport parameters
    ///
    /// Stream limits above 2^60 cannot be expressed as stream ids and are a
    /// TRANSPORT_PARAMETER_ERROR (RFC 9000 Section 4.6).
    pub fn validate(&self) -> Result<()> {
        for (id, value) in [
            (TP_INITIAL_MAX_STREAMS_BIDI, self.initial_max_streams_bidi),
            (TP_INITIAL_MAX_STREAMS_UNI, self.initial_max_streams_uni),
        ] {
            if value > MAX_STREAMS_VALUE_LIMIT {
                return Err(Error::transport(
                    TransportError::TransportParameterError,
                    0,
                    format!("transport parameter {:#x} exceeds 2^60: {}", id, value),
                ));
            }
        }

        for value in [
            self.initial_max_stream_data_bidi_local,
            self.initial_max_stream_data_bidi_remote,
            self.initial_max_stream_data_uni,
        ] {
            if value > VARINT_MAX {
                return Err(Error::transport(
                    TransportError::TransportParameterError,
                    0,
                    "stream data limit is not a varint",
                ));
            }
        }

        Ok(())
    }

    /// Initial stream limit the sender of these parameters grants for
    /// streams in `direction`.
    pub fn initial_max_streams(&self, direction: StreamDirection) -> VarInt {
        match direction {
            StreamDirection::Bidirectional => self.initial_max_streams_bidi,
            StreamDirection::Unidirectional => self.initial_max_streams_uni,
        }
    }

    /// Credit the sender of these parameters grants on a stream of type
    /// `ty`, where `sender_side` is the side that sent the parameters.
    ///
    /// Returns 0 for a unidirectional stream the sender itself opened: it
    /// never receives on such a stream.
    pub fn initial_max_stream_data(&self, sender_side: Side, ty: StreamType) -> VarInt {
        let opened_by_sender = ty.initiator() == sender_side;
        match (ty.direction(), opened_by_sender) {
            (StreamDirection::Bidirectional, true) => self.initial_max_stream_data_bidi_local,
            (StreamDirection::Bidirectional, false) => self.initial_max_stream_data_bidi_remote,
            (StreamDirection::Unidirectional, false) => self.initial_max_stream_data_uni,
            (StreamDirection::Unidirectional, true) => 0,
        }
    }
}

/// Transport Parameters Builder
///
/// Fluent interface for constructing transport parameters.
#[derive(Debug, Default)]
pub struct TransportParametersBuilder {
    params: TransportParameters,
}

impl TransportParametersBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial max stream data for bidirectional streams (local)
    pub fn initial_max_stream_data_bidi_local(mut self, max_data: VarInt) -> Self {
        self.params.initial_max_stream_data_bidi_local = max_data;
        self
    }

    /// Set initial max stream data for bidirectional streams (remote)
    pub fn initial_max_stream_data_bidi_remote(mut self, max_data: VarInt) -> Self {
        self.params.initial_max_stream_data_bidi_remote = max_data;
        self
    }

    /// Set initial max stream data for unidirectional streams
    pub fn initial_max_stream_data_uni(mut self, max_data: VarInt) -> Self {
        self.params.initial_max_stream_data_uni = max_data;
        self
    }

    /// Set initial max bidirectional streams
    pub fn initial_max_streams_bidi(mut self, max_streams: VarInt) -> Self {
        self.params.initial_max_streams_bidi = max_streams;
        self
    }

    /// Set initial max unidirectional streams
    pub fn initial_max_streams_uni(mut self, max_streams: VarInt) -> Self {
        self.params.initial_max_streams_uni = max_streams;
        self
    }

    /// Build the transport parameters
    pub fn build(self) -> Result<TransportParameters> {
        self.params.validate()?;
        Ok(self.params)
    }
}
