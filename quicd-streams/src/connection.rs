//! # Connection Collaborator
//!
//! The stream layer does not own a connection. It borrows the handful of
//! connection services it needs through the [`Connection`] trait: the
//! endpoint role, the negotiated transport parameters, connection-level
//! flow control accounting and a hook to request an opportunistic send.
//!
//! Every stream part keeps an `Arc<dyn Connection>`, so implementations must
//! be `Send + Sync` and must not call back into the stream layer while
//! holding their own locks.

#![forbid(unsafe_code)]

use crate::error::Result;
use crate::stream::state::TerminalState;
use crate::transport::TransportParameters;
use crate::types::{Side, StreamId};

/// Connection services consumed by the stream layer.
pub trait Connection: Send + Sync {
    /// True if the local endpoint is the client.
    fn is_client_connection(&self) -> bool;

    /// Parameters the local endpoint advertised, once known.
    fn local_transport_parameters(&self) -> Option<TransportParameters>;

    /// Parameters the peer advertised, once the handshake delivered them.
    fn peer_transport_parameters(&self) -> Option<TransportParameters>;

    /// Account `n` bytes of new stream data against connection-level flow
    /// control (RFC 9000 Section 4.1).
    ///
    /// Called before the data is buffered. Returns a FLOW_CONTROL_ERROR
    /// when the peer exceeded MAX_DATA.
    fn increase_received_data(&self, n: u64, frame_type: u64) -> Result<()>;

    /// Report `n` bytes consumed by readers (or discarded), so the
    /// connection can extend MAX_DATA.
    fn increase_processed_data(&self, n: u64);

    /// Ask the connection to assemble and send a packet soon.
    fn run_app_packet_space_transmitter(&self);

    /// A stream half reached a terminal state.
    fn notify_terminal_state(&self, _stream_id: StreamId, _state: TerminalState) {}

    /// The endpoint role as a [`Side`].
    fn side(&self) -> Side {
        if self.is_client_connection() {
            Side::Client
        } else {
            Side::Server
        }
    }
}
