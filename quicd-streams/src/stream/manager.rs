//! # Stream Directory and Frame Scheduler (RFC 9000 Sections 2-4, 19)
//!
//! [`ConnectionStreams`] owns every stream of one connection:
//!
//! - **Creation**: locally opened streams take a [`StreamCreationPermit`]
//!   bounded by the peer's MAX_STREAMS. Remote streams are created on first
//!   reference, together with every lower id of the same type.
//! - **Incoming frames**: STREAM, RESET_STREAM, STOP_SENDING,
//!   STREAM_DATA_BLOCKED, MAX_STREAM_DATA, MAX_STREAMS and STREAMS_BLOCKED
//!   are validated against the stream id space and routed to the right half.
//! - **Outgoing frames**: [`ConnectionStreams::produce_frames_to_send`]
//!   fills a packet budget with control frames first, then stream data from
//!   the ready set.
//! - **Reclamation**: once every half of a stream is terminal it is dropped
//!   from the directory. Dropping remote streams is what lets MAX_STREAMS
//!   move forward.
//!
//! ## Locking
//!
//! The stream table, the ready set, the control frames and the listeners
//! each have their own mutex. None is held while calling into a stream half
//! or a listener, so halves may report back through [`StreamEvents`] from
//! any thread.

#![forbid(unsafe_code)]

use crate::config::{ReadyPolicy, StreamsConfig};
use crate::connection::Connection;
use crate::error::{Error, Result, TransportError};
use crate::frames::{
    Frame, MaxStreamDataFrame, MaxStreamsFrame, ResetStreamFrame, StopSendingFrame,
    StreamDataBlockedFrame, StreamFrame, StreamsBlockedFrame, FRAME_TYPE_MAX_STREAM_DATA,
    FRAME_TYPE_RESET_STREAM, FRAME_TYPE_STOP_SENDING, FRAME_TYPE_STREAM_DATA_BLOCKED,
};
use crate::stream::permit::StreamCreationPermit;
use crate::stream::receiver::{FragmentLimits, ReceiverStream};
use crate::stream::scheduler::{BlockedSignal, ControlFrames, ReadyStreams};
use crate::stream::sender::SenderStream;
use crate::stream::state::TerminalState;
use crate::stream::{BidiStream, QuicStream, StreamContext, StreamEvents};
use crate::transport::TransportParameters;
use crate::types::{Side, StreamDirection, StreamId, StreamType, MAX_STREAMS_VALUE_LIMIT};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

const DIRECTIONS: [StreamDirection; 2] =
    [StreamDirection::Bidirectional, StreamDirection::Unidirectional];

/// Handle returned by [`ConnectionStreams::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Decides whether to claim a newly opened remote stream.
pub type StreamListener = Arc<dyn Fn(&QuicStream) -> bool + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    registered: Vec<(ListenerId, StreamListener)>,
    unclaimed: VecDeque<QuicStream>,
}

/// Stream count bookkeeping for one direction of remote streams.
#[derive(Debug, Default, Clone, Copy)]
struct RemoteLimits {
    /// Streams created so far (also the index of the next one)
    opened: u64,

    /// Streams reclaimed after reaching a terminal state
    removed: u64,

    /// Concurrent streams we allow (our initial_max_streams_*)
    window: u64,

    /// Last MAX_STREAMS value advertised
    advertised: u64,

    /// Limit the peer reported with STREAMS_BLOCKED
    peer_blocked_at: Option<u64>,
}

impl RemoteLimits {
    /// The MAX_STREAMS value to advertise now, if an increase is due.
    ///
    /// An increase is due once more than a quarter of the window has been
    /// freed since the last advertisement, or right away if the peer told
    /// us it is blocked at the current limit.
    fn max_streams_due(&self) -> Option<u64> {
        let desired = (self.removed + self.window).min(MAX_STREAMS_VALUE_LIMIT);
        if desired <= self.advertised {
            return None;
        }
        let freed = desired - self.advertised;
        let peer_blocked = self
            .peer_blocked_at
            .map_or(false, |limit| limit >= self.advertised);
        if freed * 4 > self.window || peer_blocked {
            Some(desired)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct StreamTable {
    streams: HashMap<StreamId, QuicStream>,

    /// Index of the next locally opened stream, per direction
    next_local: [u64; 2],
    remote: [RemoteLimits; 2],
    local_blocked: [BlockedSignal; 2],
    local_params: Option<TransportParameters>,
    peer_params: Option<TransportParameters>,
    terminated: Option<String>,
}

struct Shared {
    connection: Arc<dyn Connection>,
    side: Side,
    config: StreamsConfig,
    ctx: StreamContext,
    closed: AtomicBool,
    table: Mutex<StreamTable>,
    ready: Mutex<ReadyStreams>,
    control: Mutex<ControlFrames>,
    local_permits: [StreamCreationPermit; 2],
    listeners: Mutex<Listeners>,
}

/// All streams of one connection.
///
/// Cheap to clone; clones share the same directory.
#[derive(Clone)]
pub struct ConnectionStreams {
    shared: Arc<Shared>,
}

impl ConnectionStreams {
    /// Create the directory for `connection`.
    ///
    /// Transport parameters the connection already knows are applied right
    /// away; missing ones count as zero until they arrive.
    pub fn new(connection: Arc<dyn Connection>, config: StreamsConfig) -> Self {
        let side = connection.side();
        let policy = config.ready_policy_for(side.is_client());
        debug!(?side, %policy, "creating stream directory");

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let events: Weak<dyn StreamEvents> = weak.clone();
            Shared {
                ctx: StreamContext::new(connection.clone(), events),
                connection: connection.clone(),
                side,
                config,
                closed: AtomicBool::new(false),
                table: Mutex::new(StreamTable::default()),
                ready: Mutex::new(ReadyStreams::new(policy)),
                control: Mutex::new(ControlFrames::default()),
                local_permits: [
                    StreamCreationPermit::new(StreamDirection::Bidirectional, 0),
                    StreamCreationPermit::new(StreamDirection::Unidirectional, 0),
                ],
                listeners: Mutex::new(Listeners::default()),
            }
        });

        let streams = Self { shared };
        if let Some(params) = connection.local_transport_parameters() {
            streams.new_local_transport_parameters(params);
        }
        if let Some(params) = connection.peer_transport_parameters() {
            streams.new_peer_transport_parameters(params);
        }
        streams
    }

    pub fn side(&self) -> Side {
        self.shared.side
    }

    pub fn config(&self) -> &StreamsConfig {
        &self.shared.config
    }

    /// Order in which ready streams are served
    pub fn ready_policy(&self) -> ReadyPolicy {
        self.shared.ready.lock().policy()
    }

    // ------------------------------------------------------------------
    // Stream creation
    // ------------------------------------------------------------------

    /// Open a local stream, waiting up to `timeout` for the peer to allow
    /// one more.
    ///
    /// Fails with [`Error::StreamLimit`] when the peer's MAX_STREAMS does
    /// not grow in time. While waiting, STREAMS_BLOCKED is queued for the
    /// limit we hit.
    pub async fn create_stream(
        &self,
        direction: StreamDirection,
        timeout: Duration,
    ) -> Result<QuicStream> {
        self.shared.check_open()?;
        let permit = &self.shared.local_permits[direction.index()];
        if !permit.try_acquire() {
            let limit = permit.limit();
            debug!(?direction, limit, "stream limit reached, waiting");
            self.shared.table.lock().local_blocked[direction.index()].block(limit);
            self.shared.connection.run_app_packet_space_transmitter();
            permit.acquire(timeout).await?;
        }
        self.shared.open_local(direction)
    }

    /// Open a local stream if the peer currently allows one more.
    pub fn try_create_stream(&self, direction: StreamDirection) -> Result<Option<QuicStream>> {
        self.shared.check_open()?;
        let permit = &self.shared.local_permits[direction.index()];
        if !permit.try_acquire() {
            let limit = permit.limit();
            self.shared.table.lock().local_blocked[direction.index()].block(limit);
            self.shared.connection.run_app_packet_space_transmitter();
            return Ok(None);
        }
        self.shared.open_local(direction).map(Some)
    }

    /// Find a stream, creating it (and every lower id of its type) if it is
    /// a remote stream not seen yet.
    ///
    /// `Ok(None)` means the stream existed but has been reclaimed, or the
    /// connection is terminated. Referencing a local stream we never opened
    /// is a STREAM_STATE_ERROR; a remote id beyond the advertised limit is
    /// a STREAM_LIMIT_ERROR.
    pub fn get_or_create_stream(
        &self,
        stream_id: StreamId,
        frame_type: u64,
    ) -> Result<Option<QuicStream>> {
        self.shared.get_or_create(stream_id, frame_type)
    }

    /// Id the next locally opened stream of `direction` will get.
    pub fn peek_next_stream_id(&self, direction: StreamDirection) -> StreamId {
        let next = self.shared.table.lock().next_local[direction.index()];
        self.shared.local_id(direction, next)
    }

    /// True if `stream_id` has been opened on this connection, whether or
    /// not it has been reclaimed since.
    pub fn is_existing_stream_id(&self, stream_id: StreamId) -> bool {
        let direction = stream_id.stream_type().direction();
        let table = self.shared.table.lock();
        let created = if stream_id.is_local(self.shared.side) {
            table.next_local[direction.index()]
        } else {
            table.remote[direction.index()].opened
        };
        stream_id.index() < created
    }

    pub fn find_stream(&self, stream_id: StreamId) -> Option<QuicStream> {
        self.shared.table.lock().streams.get(&stream_id).cloned()
    }

    /// Snapshot of the streams in the directory.
    pub fn quic_streams(&self) -> Vec<QuicStream> {
        self.shared.table.lock().streams.values().cloned().collect()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.table.lock().streams.len()
    }

    /// Streams of `direction` we may open in total (the peer's limit).
    pub fn max_local_streams(&self, direction: StreamDirection) -> u64 {
        self.shared.local_permits[direction.index()].limit()
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Register a listener for remote streams.
    ///
    /// Listeners are offered each new remote stream in registration order;
    /// the first to return true claims it. Streams nobody claimed are kept
    /// and offered to listeners registered later, starting with this one.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&QuicStream) -> bool + Send + Sync + 'static,
    {
        let listener: StreamListener = Arc::new(listener);
        let (id, backlog) = {
            let mut listeners = self.shared.listeners.lock();
            let id = ListenerId(listeners.next_id);
            listeners.next_id += 1;
            listeners.registered.push((id, listener.clone()));
            (id, std::mem::take(&mut listeners.unclaimed))
        };
        trace!(listener = id.0, backlog = backlog.len(), "stream listener added");

        let rest: VecDeque<QuicStream> = backlog
            .into_iter()
            .filter(|stream| !listener(stream))
            .collect();
        if !rest.is_empty() {
            let mut listeners = self.shared.listeners.lock();
            let newer = std::mem::replace(&mut listeners.unclaimed, rest);
            listeners.unclaimed.extend(newer);
        }
        id
    }

    /// Unregister a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.lock();
        let before = listeners.registered.len();
        listeners.registered.retain(|(registered, _)| *registered != id);
        listeners.registered.len() != before
    }

    /// Remote streams no listener has claimed yet
    pub fn unclaimed_streams(&self) -> usize {
        self.shared.listeners.lock().unclaimed.len()
    }

    // ------------------------------------------------------------------
    // Incoming frames
    // ------------------------------------------------------------------

    pub fn process_stream_frame(&self, frame: &StreamFrame) -> Result<()> {
        match self
            .shared
            .receiving_stream(frame.stream_id, frame.frame_type())?
        {
            Some(receiver) => receiver.on_stream_frame(frame),
            None => Ok(()),
        }
    }

    pub fn process_reset_stream(&self, frame: &ResetStreamFrame) -> Result<()> {
        match self
            .shared
            .receiving_stream(frame.stream_id, FRAME_TYPE_RESET_STREAM)?
        {
            Some(receiver) => receiver.on_reset(frame.error_code, frame.final_size),
            None => Ok(()),
        }
    }

    pub fn process_stop_sending(&self, frame: &StopSendingFrame) -> Result<()> {
        if let Some(sender) = self
            .shared
            .sending_stream(frame.stream_id, FRAME_TYPE_STOP_SENDING)?
        {
            sender.stop_sending_received(frame.error_code);
        }
        Ok(())
    }

    pub fn process_stream_data_blocked(&self, frame: &StreamDataBlockedFrame) -> Result<()> {
        if let Some(receiver) = self
            .shared
            .receiving_stream(frame.stream_id, FRAME_TYPE_STREAM_DATA_BLOCKED)?
        {
            trace!(stream_id = %frame.stream_id, limit = frame.stream_data_limit, "peer blocked on stream");
            receiver.on_data_blocked();
        }
        Ok(())
    }

    pub fn process_max_stream_data(&self, frame: &MaxStreamDataFrame) -> Result<()> {
        if let Some(sender) = self
            .shared
            .sending_stream(frame.stream_id, FRAME_TYPE_MAX_STREAM_DATA)?
        {
            sender.set_max_stream_data(frame.maximum_stream_data);
        }
        Ok(())
    }

    /// Incoming MAX_STREAMS: raise the limit for locally opened streams.
    pub fn try_increase_stream_limit(&self, frame: &MaxStreamsFrame) -> Result<()> {
        if frame.maximum_streams > MAX_STREAMS_VALUE_LIMIT {
            return Err(Error::transport(
                TransportError::FrameEncodingError,
                frame.frame_type(),
                format!("MAX_STREAMS {} exceeds 2^60", frame.maximum_streams),
            ));
        }
        let direction = direction_of(frame.bidirectional);
        if self.shared.local_permits[direction.index()].try_increase_limit_to(frame.maximum_streams)
        {
            debug!(?direction, limit = frame.maximum_streams, "peer raised stream limit");
        }
        Ok(())
    }

    /// Incoming STREAMS_BLOCKED: the peer wants to open more streams.
    pub fn peer_streams_blocked(&self, frame: &StreamsBlockedFrame) -> Result<()> {
        if frame.stream_limit > MAX_STREAMS_VALUE_LIMIT {
            return Err(Error::transport(
                TransportError::FrameEncodingError,
                frame.frame_type(),
                format!("STREAMS_BLOCKED {} exceeds 2^60", frame.stream_limit),
            ));
        }
        let direction = direction_of(frame.bidirectional);
        let due = {
            let mut table = self.shared.table.lock();
            let remote = &mut table.remote[direction.index()];
            remote.peer_blocked_at = Some(remote.peer_blocked_at.unwrap_or(0).max(frame.stream_limit));
            remote.max_streams_due().is_some()
        };
        trace!(?direction, limit = frame.stream_limit, due, "peer blocked on stream limit");
        if due {
            self.shared.connection.run_app_packet_space_transmitter();
        }
        Ok(())
    }

    /// A STREAM frame we sent was acknowledged.
    pub fn on_stream_frame_acked(&self, frame: &StreamFrame) {
        let sender = self
            .find_stream(frame.stream_id)
            .and_then(|stream| stream.sender().cloned());
        if let Some(sender) = sender {
            sender.on_data_acknowledged(frame.offset, frame.len() as u64, frame.fin);
        }
    }

    /// A RESET_STREAM frame we sent was acknowledged.
    pub fn on_reset_stream_acked(&self, frame: &ResetStreamFrame) {
        let sender = self
            .find_stream(frame.stream_id)
            .and_then(|stream| stream.sender().cloned());
        if let Some(sender) = sender {
            sender.on_reset_acknowledged();
        }
    }

    // ------------------------------------------------------------------
    // Transport parameters
    // ------------------------------------------------------------------

    /// Apply the parameters we advertise: remote stream windows and the
    /// receive credit of streams created from now on.
    pub fn new_local_transport_parameters(&self, params: TransportParameters) {
        let mut table = self.shared.table.lock();
        for direction in DIRECTIONS {
            let remote = &mut table.remote[direction.index()];
            remote.window = params.initial_max_streams(direction);
            remote.advertised = remote.advertised.max(remote.window);
        }
        table.local_params = Some(params);
        debug!(
            max_streams_bidi = params.initial_max_streams_bidi,
            max_streams_uni = params.initial_max_streams_uni,
            "local transport parameters applied"
        );
    }

    /// Apply the peer's parameters: local stream limits and the send credit
    /// of every existing sending half.
    pub fn new_peer_transport_parameters(&self, params: TransportParameters) {
        let senders: Vec<Arc<SenderStream>> = {
            let mut table = self.shared.table.lock();
            table.peer_params = Some(params);
            table
                .streams
                .values()
                .filter_map(|stream| stream.sender().cloned())
                .collect()
        };
        for direction in DIRECTIONS {
            self.shared.local_permits[direction.index()]
                .try_increase_limit_to(params.initial_max_streams(direction));
        }
        let peer = self.shared.side.opposite();
        for sender in senders {
            sender.set_max_stream_data(params.initial_max_stream_data(peer, sender.id().stream_type()));
        }
        debug!(
            max_streams_bidi = params.initial_max_streams_bidi,
            max_streams_uni = params.initial_max_streams_uni,
            "peer transport parameters applied"
        );
    }

    // ------------------------------------------------------------------
    // Outgoing frames
    // ------------------------------------------------------------------

    /// The MAX_STREAMS value to advertise next for remote streams of
    /// `direction`, or `None` if no increase is due.
    pub fn next_max_streams_limit(&self, direction: StreamDirection) -> Option<u64> {
        self.shared.table.lock().remote[direction.index()].max_streams_due()
    }

    /// True if some stream has data (or a FIN) ready to send.
    pub fn has_available_data(&self) -> bool {
        !self.shared.ready.lock().is_empty()
    }

    /// True if control frames are waiting to be sent.
    pub fn has_control_frames(&self) -> bool {
        if !self.shared.control.lock().is_empty() {
            return true;
        }
        let table = self.shared.table.lock();
        table.remote.iter().any(|r| r.max_streams_due().is_some())
    }

    /// True if a STREAMS_BLOCKED frame is waiting to be sent.
    pub fn has_blocked_streams(&self) -> bool {
        let table = self.shared.table.lock();
        DIRECTIONS
            .iter()
            .any(|d| self.shared.streams_blocked_owed(&table, *d).is_some())
    }

    /// Fill up to `max_frame_bytes` of frames into `frames`, carrying at
    /// most `max_connection_bytes` of stream data.
    ///
    /// Frames are produced in this order: STREAMS_BLOCKED, STOP_SENDING and
    /// MAX_STREAM_DATA, RESET_STREAM, STREAM_DATA_BLOCKED left over from an
    /// earlier call, MAX_STREAMS, then STREAM frames (each followed by
    /// STREAM_DATA_BLOCKED when the stream ran out of credit).
    /// Frames that do not fit stay queued for the next call.
    ///
    /// Returns the stream data bytes produced.
    pub fn produce_frames_to_send(
        &self,
        max_frame_bytes: usize,
        max_connection_bytes: u64,
        frames: &mut Vec<Frame>,
    ) -> u64 {
        let mut budget = max_frame_bytes;
        self.shared.emit_streams_blocked(&mut budget, frames);
        {
            let mut control = self.shared.control.lock();
            control.emit_stream_control(&mut budget, frames);
            control.emit_resets(&mut budget, frames);
            control.emit_data_blocked(&mut budget, frames);
        }
        self.shared.emit_max_streams(&mut budget, frames);
        self.shared
            .emit_stream_data(&mut budget, max_connection_bytes, frames)
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Tear down every stream: wake readers, writers and permit waiters
    /// with [`Error::ConnectionClosed`]. Idempotent.
    pub fn terminate(&self, reason: &str) {
        let streams: Vec<QuicStream> = {
            let mut table = self.shared.table.lock();
            if table.terminated.is_some() {
                return;
            }
            table.terminated = Some(reason.to_string());
            self.shared.closed.store(true, Ordering::Release);
            table.streams.drain().map(|(_, stream)| stream).collect()
        };
        debug!(reason, streams = streams.len(), "terminating streams");

        self.shared.ready.lock().clear();
        self.shared.control.lock().clear();
        self.shared.listeners.lock().unclaimed.clear();
        for permit in &self.shared.local_permits {
            permit.terminate(reason);
        }
        for stream in streams {
            stream.terminate(reason);
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for ConnectionStreams {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionStreams")
            .field("side", &self.shared.side)
            .field("streams", &self.stream_count())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

fn direction_of(bidirectional: bool) -> StreamDirection {
    if bidirectional {
        StreamDirection::Bidirectional
    } else {
        StreamDirection::Unidirectional
    }
}

impl Shared {
    fn check_open(&self) -> Result<()> {
        match &self.table.lock().terminated {
            Some(reason) => Err(Error::connection_closed(reason.clone())),
            None => Ok(()),
        }
    }

    fn local_id(&self, direction: StreamDirection, index: u64) -> StreamId {
        StreamId((index << 2) | StreamType::new(self.side, direction).bits())
    }

    fn fragment_limits(&self) -> FragmentLimits {
        FragmentLimits {
            max_fragments: self.config.max_out_of_order_fragments,
            min_average_size: self.config.min_average_fragment_size,
        }
    }

    /// Build the halves for `id` with the credits currently negotiated.
    fn new_stream(&self, table: &StreamTable, id: StreamId) -> QuicStream {
        let ty = id.stream_type();
        let new_sender = || {
            let credit = table
                .peer_params
                .map_or(0, |p| p.initial_max_stream_data(self.side.opposite(), ty));
            Arc::new(SenderStream::new(
                id,
                credit,
                self.config.send_buffer_size,
                self.ctx.clone(),
            ))
        };
        let new_receiver = || {
            let credit = table
                .local_params
                .map_or(0, |p| p.initial_max_stream_data(self.side, ty));
            Arc::new(ReceiverStream::new(
                id,
                credit,
                self.config.receive_window,
                self.fragment_limits(),
                self.ctx.clone(),
            ))
        };

        if ty.is_bidirectional() {
            QuicStream::Bidi(Arc::new(BidiStream::new(new_sender(), new_receiver())))
        } else if id.is_local(self.side) {
            QuicStream::Send(new_sender())
        } else {
            QuicStream::Recv(new_receiver())
        }
    }

    /// Register the next local stream of `direction`. The caller holds a
    /// permit for it.
    fn open_local(&self, direction: StreamDirection) -> Result<QuicStream> {
        let mut table = self.table.lock();
        if let Some(reason) = &table.terminated {
            return Err(Error::connection_closed(reason.clone()));
        }
        let index = table.next_local[direction.index()];
        table.next_local[direction.index()] += 1;
        let id = self.local_id(direction, index);
        let stream = self.new_stream(&table, id);
        table.streams.insert(id, stream.clone());
        debug!(stream_id = %id, ?direction, "opened local stream");
        Ok(stream)
    }

    fn get_or_create(&self, id: StreamId, frame_type: u64) -> Result<Option<QuicStream>> {
        let created = {
            let mut table = self.table.lock();
            if table.terminated.is_some() {
                return Ok(None);
            }
            if let Some(stream) = table.streams.get(&id) {
                return Ok(Some(stream.clone()));
            }

            let ty = id.stream_type();
            let slot = ty.direction().index();
            if id.is_local(self.side) {
                if id.index() >= table.next_local[slot] {
                    warn!(stream_id = %id, "frame for local stream never opened");
                    return Err(Error::transport(
                        TransportError::StreamStateError,
                        frame_type,
                        format!("stream {} has not been opened", id),
                    ));
                }
                return Ok(None);
            }

            let limits = table.remote[slot];
            if id.index() < limits.opened {
                return Ok(None);
            }
            if id.index() >= limits.advertised {
                warn!(stream_id = %id, limit = limits.advertised, "peer exceeded stream limit");
                return Err(Error::transport(
                    TransportError::StreamLimitError,
                    frame_type,
                    format!(
                        "stream {} exceeds the limit of {} streams",
                        id, limits.advertised
                    ),
                ));
            }

            let mut created = Vec::new();
            for index in limits.opened..=id.index() {
                let stream_id = StreamId((index << 2) | ty.bits());
                let stream = self.new_stream(&table, stream_id);
                table.streams.insert(stream_id, stream.clone());
                created.push(stream);
            }
            table.remote[slot].opened = id.index() + 1;
            debug!(stream_id = %id, count = created.len(), "opened remote streams");
            created
        };

        let found = created.last().cloned();
        for stream in created {
            self.offer(stream);
        }
        Ok(found)
    }

    /// The receiving half addressed by an incoming frame.
    fn receiving_stream(
        &self,
        id: StreamId,
        frame_type: u64,
    ) -> Result<Option<Arc<ReceiverStream>>> {
        if id.is_unidirectional() && id.is_local(self.side) {
            warn!(stream_id = %id, frame_type, "receive frame on send-only stream");
            return Err(Error::transport(
                TransportError::StreamStateError,
                frame_type,
                format!("stream {} is send-only", id),
            ));
        }
        Ok(self
            .get_or_create(id, frame_type)?
            .and_then(|stream| stream.receiver().cloned()))
    }

    /// The sending half addressed by an incoming frame.
    fn sending_stream(&self, id: StreamId, frame_type: u64) -> Result<Option<Arc<SenderStream>>> {
        if id.is_unidirectional() && !id.is_local(self.side) {
            warn!(stream_id = %id, frame_type, "send frame on receive-only stream");
            return Err(Error::transport(
                TransportError::StreamStateError,
                frame_type,
                format!("stream {} is receive-only", id),
            ));
        }
        Ok(self
            .get_or_create(id, frame_type)?
            .and_then(|stream| stream.sender().cloned()))
    }

    /// Offer a new remote stream to listeners, or keep it for later ones.
    fn offer(&self, stream: QuicStream) {
        // Listener ids below `seen` have already declined
        let mut seen = 0;
        loop {
            let candidates: Vec<StreamListener> = {
                let mut listeners = self.listeners.lock();
                if listeners.next_id == seen {
                    trace!(stream_id = %stream.id(), "remote stream unclaimed");
                    listeners.unclaimed.push_back(stream);
                    return;
                }
                let candidates = listeners
                    .registered
                    .iter()
                    .filter(|(id, _)| id.0 >= seen)
                    .map(|(_, listener)| listener.clone())
                    .collect();
                seen = listeners.next_id;
                candidates
            };
            for listener in candidates {
                if listener(&stream) {
                    trace!(stream_id = %stream.id(), "remote stream claimed");
                    return;
                }
            }
        }
    }

    /// Limit a STREAMS_BLOCKED frame is owed for, if we are still blocked
    /// at it.
    fn streams_blocked_owed(&self, table: &StreamTable, direction: StreamDirection) -> Option<u64> {
        let limit = table.local_blocked[direction.index()].pending()?;
        let permit = &self.local_permits[direction.index()];
        (permit.limit() <= limit).then_some(limit)
    }

    fn emit_streams_blocked(&self, budget: &mut usize, frames: &mut Vec<Frame>) {
        let mut table = self.table.lock();
        for direction in DIRECTIONS {
            let slot = direction.index();
            let permit = &self.local_permits[slot];
            // Waiters still queued after the limit grew are blocked again
            if permit.waiting() > 0 {
                table.local_blocked[slot].block(permit.limit());
            }
            let Some(limit) = table.local_blocked[slot].pending() else {
                continue;
            };
            if permit.limit() > limit {
                table.local_blocked[slot].unblock();
                continue;
            }
            let frame = StreamsBlockedFrame {
                stream_limit: limit,
                bidirectional: direction.is_bidirectional(),
            };
            if frame.size() <= *budget {
                *budget -= frame.size();
                frames.push(Frame::StreamsBlocked(frame));
                table.local_blocked[slot].mark_sent(limit);
                trace!(?direction, limit, "STREAMS_BLOCKED");
            }
        }
    }

    fn emit_max_streams(&self, budget: &mut usize, frames: &mut Vec<Frame>) {
        let mut table = self.table.lock();
        for direction in DIRECTIONS {
            let remote = &mut table.remote[direction.index()];
            let Some(maximum_streams) = remote.max_streams_due() else {
                continue;
            };
            let frame = MaxStreamsFrame {
                maximum_streams,
                bidirectional: direction.is_bidirectional(),
            };
            if frame.size() <= *budget {
                *budget -= frame.size();
                frames.push(Frame::MaxStreams(frame));
                remote.advertised = maximum_streams;
                remote.peer_blocked_at = None;
                debug!(?direction, maximum_streams, "MAX_STREAMS");
            }
        }
    }

    fn emit_stream_data(
        &self,
        budget: &mut usize,
        max_connection_bytes: u64,
        frames: &mut Vec<Frame>,
    ) -> u64 {
        let mut sent = 0u64;
        let mut deferred = None;

        loop {
            // Popped before polling: a producer signalling meanwhile
            // re-inserts the stream instead of being lost.
            let Some(sender) = self.ready.lock().pop() else {
                break;
            };
            let id = sender.id();
            let Some(capacity) = StreamFrame::payload_capacity(id, sender.bytes_sent(), *budget)
            else {
                deferred = Some(sender);
                break;
            };
            let allowance = (capacity as u64).min(max_connection_bytes - sent);

            let (chunk, signals) = sender.produce(allowance);
            let produced = chunk.is_some();
            if let Some(chunk) = chunk {
                let frame = StreamFrame::new(id, chunk.offset, chunk.data, chunk.fin);
                *budget -= frame.size();
                sent += frame.len() as u64;
                trace!(stream_id = %id, offset = frame.offset, len = frame.len(), fin = frame.fin, "STREAM");
                frames.push(Frame::Stream(frame));
            }

            if let Some(limit) = signals.blocked_at {
                let blocked = StreamDataBlockedFrame {
                    stream_id: id,
                    stream_data_limit: limit,
                };
                if sender.report_data_blocked(limit) {
                    if blocked.size() <= *budget {
                        *budget -= blocked.size();
                        frames.push(Frame::StreamDataBlocked(blocked));
                        trace!(stream_id = %id, limit, "STREAM_DATA_BLOCKED");
                    } else {
                        self.control.lock().data_blocked(&sender, limit);
                    }
                }
            }

            if signals.has_more {
                if produced {
                    self.ready.lock().insert(&sender);
                } else {
                    // Out of packet or connection budget
                    deferred = Some(sender);
                    break;
                }
            }
        }

        if let Some(sender) = deferred {
            self.ready.lock().defer(sender);
        }
        sent
    }
}

impl StreamEvents for Shared {
    fn data_available(&self, sender: &Arc<SenderStream>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let inserted = self.ready.lock().insert(sender);
        if inserted {
            trace!(stream_id = %sender.id(), "stream ready");
        }
        self.connection.run_app_packet_space_transmitter();
    }

    fn terminal_state(&self, stream_id: StreamId, state: TerminalState) {
        let due = {
            let mut table = self.table.lock();
            match table.streams.get(&stream_id) {
                Some(stream) if stream.is_terminal() => {}
                _ => return,
            }
            table.streams.remove(&stream_id);
            if stream_id.is_local(self.side) {
                false
            } else {
                let remote = &mut table.remote[stream_id.stream_type().direction().index()];
                remote.removed += 1;
                remote.max_streams_due().is_some()
            }
        };
        self.ready.lock().remove(stream_id);
        self.control.lock().forget(stream_id);
        debug!(stream_id = %stream_id, %state, "stream reclaimed");
        if due {
            self.connection.run_app_packet_space_transmitter();
        }
    }

    fn request_reset_stream(&self, stream_id: StreamId, error_code: u64, final_size: u64) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.control.lock().reset_stream(ResetStreamFrame {
            stream_id,
            error_code,
            final_size,
        });
        self.ready.lock().remove(stream_id);
        self.connection.run_app_packet_space_transmitter();
    }

    fn schedule_stop_sending(&self, stream_id: StreamId, error_code: u64) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.control.lock().stop_sending(stream_id, error_code);
        self.connection.run_app_packet_space_transmitter();
    }

    fn request_send_max_stream_data(&self, stream_id: StreamId, max_stream_data: u64) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.control.lock().max_stream_data(stream_id, max_stream_data) {
            self.connection.run_app_packet_space_transmitter();
        }
    }
}
