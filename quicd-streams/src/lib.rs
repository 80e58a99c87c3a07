//! quicd-streams: Per-Connection QUIC Stream Management
//!
//! This crate implements the stream layer of a QUIC connection as specified
//! in RFC 9000 Sections 2-4: stream state machines, stream-level flow
//! control and the scheduling of stream frames into outgoing packets.
//!
//! # Architecture
//!
//! - **Shared halves**: each stream half is an `Arc` with its own small lock,
//!   shared by the application handle and the packet assembler
//! - **Lock-free state**: sending and receiving states are atomic lattices
//!   advanced by compare-and-set
//! - **Pull-based sending**: the connection asks for frames when it builds a
//!   packet; writers only mark their stream ready
//! - **Zero-copy payloads**: `bytes::Bytes` end to end, split rather than
//!   copied where possible
//! - **Never blocks**: waiting for credit or for a stream permit is an
//!   `async` operation on tokio primitives
//!
//! # RFC Compliance
//!
//! - **RFC 9000 Section 2**: stream ids, types and implicit opening
//! - **RFC 9000 Section 3**: sending and receiving state machines
//! - **RFC 9000 Section 4**: stream and stream-count flow control
//! - **RFC 9000 Section 19**: size accounting for the stream frames
//!
//! # Module Organization
//!
//! - `types`: stream ids, stream types, endpoint side
//! - `error`: transport error codes and the crate error type
//! - `frames`: the stream-related frames
//! - `transport`: stream-related transport parameters
//! - `config`: tunables
//! - `connection`: the connection services the layer relies on
//! - `flow_control`: send queue and receive credit
//! - `stream`: stream halves, handles, permits and the per-connection directory
//! - `sequential`: coalescing runner for maintenance passes

pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod sequential;
pub mod stream;
pub mod transport;
pub mod types;

// Re-export key types
pub use config::{ReadyPolicy, StreamsConfig};
pub use connection::Connection;
pub use error::{Error, Result, TransportError};
pub use frames::Frame;
pub use stream::{
    BidiState, ConnectionStreams, ListenerId, QuicStream, ReceivingState, SendingState,
    StreamChunk, StreamCreationPermit, StreamReader, StreamWriter, TerminalState,
};
pub use transport::{TransportParameters, TransportParametersBuilder};
pub use types::{Side, StreamDirection, StreamId, StreamType};
