//! Shared fixtures for the integration tests.
//!
//! `MockConnection` stands in for the connection the stream layer is
//! embedded in. `Pair` wires a client and a server directory together and
//! moves frames between them as a lossless, instantly acknowledging network.

#![allow(dead_code)]

use parking_lot::Mutex;
use quicd_streams::frames::Frame;
use quicd_streams::{
    Connection, ConnectionStreams, Error, Result, StreamId, StreamsConfig, TerminalState,
    TransportError, TransportParameters,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

/// Install a tracing subscriber once per test binary. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Records what the stream layer asks of its connection.
#[derive(Debug, Default)]
pub struct MockConnection {
    pub is_client: bool,
    pub local_params: Option<TransportParameters>,
    pub peer_params: Option<TransportParameters>,

    /// Connection-level receive limit (MAX_DATA), if enforced
    pub max_data: Option<u64>,
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub transmits: AtomicUsize,
    pub terminal: Mutex<Vec<(StreamId, TerminalState)>>,
}

impl MockConnection {
    pub fn new(is_client: bool, local: TransportParameters, peer: TransportParameters) -> Self {
        Self {
            is_client,
            local_params: Some(local),
            peer_params: Some(peer),
            ..Default::default()
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn transmits(&self) -> usize {
        self.transmits.load(Ordering::SeqCst)
    }

    pub fn terminal_states(&self) -> Vec<(StreamId, TerminalState)> {
        self.terminal.lock().clone()
    }
}

impl Connection for MockConnection {
    fn is_client_connection(&self) -> bool {
        self.is_client
    }

    fn local_transport_parameters(&self) -> Option<TransportParameters> {
        self.local_params
    }

    fn peer_transport_parameters(&self) -> Option<TransportParameters> {
        self.peer_params
    }

    fn increase_received_data(&self, n: u64, frame_type: u64) -> Result<()> {
        let total = self.received.fetch_add(n, Ordering::SeqCst) + n;
        match self.max_data {
            Some(max) if total > max => Err(Error::transport(
                TransportError::FlowControlError,
                frame_type,
                format!("connection data {} beyond MAX_DATA {}", total, max),
            )),
            _ => Ok(()),
        }
    }

    fn increase_processed_data(&self, n: u64) {
        self.processed.fetch_add(n, Ordering::SeqCst);
    }

    fn run_app_packet_space_transmitter(&self) {
        self.transmits.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_terminal_state(&self, stream_id: StreamId, state: TerminalState) {
        self.terminal.lock().push((stream_id, state));
    }
}

/// Parameters granting `max_streams` of each type and `max_stream_data`
/// on every stream.
pub fn params(max_streams: u64, max_stream_data: u64) -> TransportParameters {
    TransportParameters {
        initial_max_stream_data_bidi_local: max_stream_data,
        initial_max_stream_data_bidi_remote: max_stream_data,
        initial_max_stream_data_uni: max_stream_data,
        initial_max_streams_bidi: max_streams,
        initial_max_streams_uni: max_streams,
    }
}

/// One endpoint's directory with its mock connection.
pub fn endpoint(
    is_client: bool,
    local: TransportParameters,
    peer: TransportParameters,
) -> (Arc<MockConnection>, ConnectionStreams) {
    init_tracing();
    let connection = Arc::new(MockConnection::new(is_client, local, peer));
    let streams = ConnectionStreams::new(connection.clone(), StreamsConfig::default());
    (connection, streams)
}

/// Frames produced by one call with no connection-level cap.
pub fn produce(streams: &ConnectionStreams, max_frame_bytes: usize) -> Vec<Frame> {
    let mut frames = Vec::new();
    streams.produce_frames_to_send(max_frame_bytes, u64::MAX, &mut frames);
    frames
}

/// (stream id, payload length) of every STREAM frame.
pub fn stream_frames(frames: &[Frame]) -> Vec<(u64, usize)> {
    frames
        .iter()
        .filter_map(|f| match f {
            Frame::Stream(s) => Some((s.stream_id.value(), s.len())),
            _ => None,
        })
        .collect()
}

/// A client and a server connected back to back.
pub struct Pair {
    pub client_conn: Arc<MockConnection>,
    pub client: ConnectionStreams,
    pub server_conn: Arc<MockConnection>,
    pub server: ConnectionStreams,
}

impl Pair {
    /// `client_params` are what the client advertises, `server_params`
    /// what the server advertises.
    pub fn new(client_params: TransportParameters, server_params: TransportParameters) -> Self {
        let (client_conn, client) = endpoint(true, client_params, server_params);
        let (server_conn, server) = endpoint(false, server_params, client_params);
        Self {
            client_conn,
            client,
            server_conn,
            server,
        }
    }

    /// Move one packet's worth of frames from the client to the server.
    pub fn client_to_server(&self, max_frame_bytes: usize) -> Result<Vec<Frame>> {
        deliver(&self.client, &self.server, max_frame_bytes)
    }

    /// Move one packet's worth of frames from the server to the client.
    pub fn server_to_client(&self, max_frame_bytes: usize) -> Result<Vec<Frame>> {
        deliver(&self.server, &self.client, max_frame_bytes)
    }

    /// Exchange packets both ways until neither side has anything to send.
    pub fn settle(&self, max_frame_bytes: usize) -> Result<usize> {
        let mut rounds = 0;
        loop {
            let up = self.client_to_server(max_frame_bytes)?;
            let down = self.server_to_client(max_frame_bytes)?;
            if up.is_empty() && down.is_empty() {
                return Ok(rounds);
            }
            rounds += 1;
            assert!(rounds < 10_000, "endpoints never settled");
        }
    }
}

/// Produce frames on `from`, hand them to `to`, and acknowledge them back
/// on `from`.
pub fn deliver(
    from: &ConnectionStreams,
    to: &ConnectionStreams,
    max_frame_bytes: usize,
) -> Result<Vec<Frame>> {
    let frames = produce(from, max_frame_bytes);
    for frame in &frames {
        match frame {
            Frame::Stream(f) => {
                to.process_stream_frame(f)?;
                from.on_stream_frame_acked(f);
            }
            Frame::ResetStream(f) => {
                to.process_reset_stream(f)?;
                from.on_reset_stream_acked(f);
            }
            Frame::StopSending(f) => to.process_stop_sending(f)?,
            Frame::MaxStreamData(f) => to.process_max_stream_data(f)?,
            Frame::MaxStreams(f) => to.try_increase_stream_limit(f)?,
            Frame::StreamDataBlocked(f) => to.process_stream_data_blocked(f)?,
            Frame::StreamsBlocked(f) => to.peer_streams_blocked(f)?,
        }
    }
    Ok(frames)
}
