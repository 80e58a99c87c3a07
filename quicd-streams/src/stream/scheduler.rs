//! # Send Scheduling State
//!
//! Bookkeeping the directory consults when it assembles frames:
//!
//! - [`ReadyStreams`]: sending halves with something to send, drained under
//!   one of two [`ReadyPolicy`] orders.
//! - [`ControlFrames`]: pending STOP_SENDING, MAX_STREAM_DATA,
//!   RESET_STREAM and deferred STREAM_DATA_BLOCKED work, at most one of
//!   each kind per stream.
//! - [`BlockedSignal`]: STREAMS_BLOCKED bookkeeping for one direction.

#![forbid(unsafe_code)]

use crate::config::ReadyPolicy;
use crate::frames::{
    Frame, MaxStreamDataFrame, ResetStreamFrame, StopSendingFrame, StreamDataBlockedFrame,
};
use crate::stream::sender::SenderStream;
use crate::types::StreamId;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Sending halves waiting for the packet assembler.
///
/// Inserting a stream that is already present is a no-op, so producers can
/// signal readiness as often as they like.
#[derive(Debug)]
pub(crate) enum ReadyStreams {
    /// Serve streams in turn; a stream that still has data goes to the back.
    RoundRobin {
        order: VecDeque<StreamId>,
        streams: HashMap<StreamId, Arc<SenderStream>>,
    },

    /// Always serve the lowest ready id.
    LowestIdFirst(BTreeMap<StreamId, Arc<SenderStream>>),
}

impl ReadyStreams {
    pub(crate) fn new(policy: ReadyPolicy) -> Self {
        match policy {
            ReadyPolicy::RoundRobin => ReadyStreams::RoundRobin {
                order: VecDeque::new(),
                streams: HashMap::new(),
            },
            ReadyPolicy::LowestIdFirst => ReadyStreams::LowestIdFirst(BTreeMap::new()),
        }
    }

    pub(crate) fn policy(&self) -> ReadyPolicy {
        match self {
            ReadyStreams::RoundRobin { .. } => ReadyPolicy::RoundRobin,
            ReadyStreams::LowestIdFirst(_) => ReadyPolicy::LowestIdFirst,
        }
    }

    /// Add `sender` at the back. Returns false if it was already ready.
    pub(crate) fn insert(&mut self, sender: &Arc<SenderStream>) -> bool {
        let id = sender.id();
        match self {
            ReadyStreams::RoundRobin { order, streams } => {
                if streams.contains_key(&id) {
                    return false;
                }
                streams.insert(id, sender.clone());
                order.push_back(id);
                true
            }
            ReadyStreams::LowestIdFirst(streams) => {
                if streams.contains_key(&id) {
                    return false;
                }
                streams.insert(id, sender.clone());
                true
            }
        }
    }

    /// Put back a stream that was popped but could not be served, so it is
    /// first in line next time.
    pub(crate) fn defer(&mut self, sender: Arc<SenderStream>) {
        let id = sender.id();
        match self {
            ReadyStreams::RoundRobin { order, streams } => {
                if streams.insert(id, sender).is_none() {
                    order.push_front(id);
                }
            }
            ReadyStreams::LowestIdFirst(streams) => {
                streams.insert(id, sender);
            }
        }
    }

    /// Take the next stream to serve.
    pub(crate) fn pop(&mut self) -> Option<Arc<SenderStream>> {
        match self {
            ReadyStreams::RoundRobin { order, streams } => {
                while let Some(id) = order.pop_front() {
                    if let Some(sender) = streams.remove(&id) {
                        return Some(sender);
                    }
                }
                None
            }
            ReadyStreams::LowestIdFirst(streams) => streams.pop_first().map(|(_, s)| s),
        }
    }

    pub(crate) fn remove(&mut self, id: StreamId) {
        match self {
            ReadyStreams::RoundRobin { order, streams } => {
                if streams.remove(&id).is_some() {
                    order.retain(|queued| *queued != id);
                }
            }
            ReadyStreams::LowestIdFirst(streams) => {
                streams.remove(&id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: StreamId) -> bool {
        match self {
            ReadyStreams::RoundRobin { streams, .. } => streams.contains_key(&id),
            ReadyStreams::LowestIdFirst(streams) => streams.contains_key(&id),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            ReadyStreams::RoundRobin { streams, .. } => streams.len(),
            ReadyStreams::LowestIdFirst(streams) => streams.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn clear(&mut self) {
        match self {
            ReadyStreams::RoundRobin { order, streams } => {
                order.clear();
                streams.clear();
            }
            ReadyStreams::LowestIdFirst(streams) => streams.clear(),
        }
    }
}

/// Pending per-stream flow control work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamControl {
    StopSending(u64),
    MaxStreamData(u64),
}

impl StreamControl {
    fn frame(self, stream_id: StreamId) -> Frame {
        match self {
            StreamControl::StopSending(error_code) => Frame::StopSending(StopSendingFrame {
                stream_id,
                error_code,
            }),
            StreamControl::MaxStreamData(maximum_stream_data) => {
                Frame::MaxStreamData(MaxStreamDataFrame {
                    stream_id,
                    maximum_stream_data,
                })
            }
        }
    }
}

/// Control frames waiting for room in a packet.
///
/// STOP_SENDING replaces a pending MAX_STREAM_DATA for the same stream and
/// is never replaced by one; a higher MAX_STREAM_DATA replaces a lower one.
#[derive(Debug, Default)]
pub(crate) struct ControlFrames {
    per_stream: BTreeMap<StreamId, StreamControl>,
    resets: BTreeMap<StreamId, ResetStreamFrame>,

    /// STREAM_DATA_BLOCKED that did not fit next to the data it belongs to
    data_blocked: BTreeMap<StreamId, (Arc<SenderStream>, u64)>,
}

impl ControlFrames {
    pub(crate) fn stop_sending(&mut self, stream_id: StreamId, error_code: u64) {
        self.per_stream
            .insert(stream_id, StreamControl::StopSending(error_code));
    }

    /// Returns false if the request was absorbed by pending work.
    pub(crate) fn max_stream_data(&mut self, stream_id: StreamId, max: u64) -> bool {
        match self.per_stream.get(&stream_id) {
            Some(StreamControl::StopSending(_)) => false,
            Some(StreamControl::MaxStreamData(pending)) if *pending >= max => false,
            _ => {
                self.per_stream
                    .insert(stream_id, StreamControl::MaxStreamData(max));
                true
            }
        }
    }

    pub(crate) fn reset_stream(&mut self, frame: ResetStreamFrame) {
        self.resets.entry(frame.stream_id).or_insert(frame);
    }

    /// Queue STREAM_DATA_BLOCKED for `limit` for a later packet.
    pub(crate) fn data_blocked(&mut self, sender: &Arc<SenderStream>, limit: u64) {
        self.data_blocked
            .insert(sender.id(), (Arc::clone(sender), limit));
    }

    /// Drop work for a stream that no longer exists. A pending
    /// RESET_STREAM is kept: the peer still needs it.
    pub(crate) fn forget(&mut self, stream_id: StreamId) {
        self.per_stream.remove(&stream_id);
        self.data_blocked.remove(&stream_id);
    }

    #[cfg(test)]
    pub(crate) fn get(&self, stream_id: StreamId) -> Option<StreamControl> {
        self.per_stream.get(&stream_id).copied()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.per_stream.is_empty() && self.resets.is_empty() && self.data_blocked.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.per_stream.clear();
        self.resets.clear();
        self.data_blocked.clear();
    }

    /// Move STOP_SENDING and MAX_STREAM_DATA frames that fit into `frames`,
    /// lowest stream id first.
    pub(crate) fn emit_stream_control(&mut self, budget: &mut usize, frames: &mut Vec<Frame>) {
        self.per_stream.retain(|&stream_id, control| {
            let frame = control.frame(stream_id);
            let size = frame.size();
            if size > *budget {
                return true;
            }
            *budget -= size;
            frames.push(frame);
            false
        });
    }

    /// Move deferred STREAM_DATA_BLOCKED frames that fit into `frames`.
    ///
    /// An entry whose stream got more credit or was reset meanwhile is
    /// dropped instead.
    pub(crate) fn emit_data_blocked(&mut self, budget: &mut usize, frames: &mut Vec<Frame>) {
        self.data_blocked.retain(|&stream_id, (sender, limit)| {
            if sender.max_stream_data() != *limit || sender.state().is_reset() {
                return false;
            }
            let frame = StreamDataBlockedFrame {
                stream_id,
                stream_data_limit: *limit,
            };
            let size = frame.size();
            if size > *budget {
                return true;
            }
            *budget -= size;
            frames.push(Frame::StreamDataBlocked(frame));
            false
        });
    }

    /// Move RESET_STREAM frames that fit into `frames`.
    pub(crate) fn emit_resets(&mut self, budget: &mut usize, frames: &mut Vec<Frame>) {
        self.resets.retain(|_, reset| {
            let size = reset.size();
            if size > *budget {
                return true;
            }
            *budget -= size;
            frames.push(Frame::ResetStream(*reset));
            false
        });
    }
}

/// STREAMS_BLOCKED state for locally opened streams of one direction.
///
/// One frame is sent per blocking limit; a new one is due only once the
/// peer raised the limit and we hit it again.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockedSignal {
    blocked_at: Option<u64>,
    sent_for: Option<u64>,
}

impl BlockedSignal {
    pub(crate) fn block(&mut self, limit: u64) {
        if self.blocked_at.map_or(true, |at| limit > at) {
            self.blocked_at = Some(limit);
        }
    }

    /// The limit a STREAMS_BLOCKED frame is owed for.
    pub(crate) fn pending(&self) -> Option<u64> {
        match self.blocked_at {
            Some(limit) if self.sent_for != Some(limit) => Some(limit),
            _ => None,
        }
    }

    pub(crate) fn mark_sent(&mut self, limit: u64) {
        self.sent_for = Some(limit);
    }

    /// The limit moved past the recorded block before it was reported.
    pub(crate) fn unblock(&mut self) {
        self.blocked_at = self.sent_for;
    }
}
