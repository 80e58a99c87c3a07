//! Application-facing read handle.

#![forbid(unsafe_code)]

use crate::error::Result;
use crate::stream::receiver::ReceiverStream;
use crate::stream::state::ReceivingState;
use crate::types::StreamId;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;

/// What a read produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// The next bytes of the stream, in order
    Data(Bytes),

    /// The end of the stream; every byte has been read
    Fin,
}

/// Reads from the receiving half of a stream.
///
/// At most one reader is attached to a stream at a time.
#[derive(Debug)]
pub struct StreamReader {
    receiver: Arc<ReceiverStream>,
}

impl StreamReader {
    pub(crate) fn attach(receiver: Arc<ReceiverStream>) -> Self {
        receiver.attach_reader();
        Self { receiver }
    }

    pub fn stream_id(&self) -> StreamId {
        self.receiver.id()
    }

    pub fn state(&self) -> ReceivingState {
        self.receiver.state()
    }

    /// Bytes that can be read without waiting
    pub fn available(&self) -> u64 {
        self.receiver.readable()
    }

    /// Take the next chunk without waiting. `Ok(None)` means nothing has
    /// arrived yet.
    pub fn poll(&self) -> Result<Option<StreamChunk>> {
        self.receiver.poll_read()
    }

    /// Wait for the next chunk. `Ok(None)` marks the end of the stream.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        loop {
            let notified = self.receiver.notified();
            match self.receiver.poll_read()? {
                Some(StreamChunk::Data(data)) => return Ok(Some(data)),
                Some(StreamChunk::Fin) => return Ok(None),
                None => notified.await,
            }
        }
    }

    /// Read until the end of the stream.
    pub async fn read_to_end(&self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(data) = self.read().await? {
            out.extend_from_slice(&data);
        }
        Ok(out.freeze())
    }

    /// Ask the peer to stop sending; unread data is discarded.
    pub fn stop_sending(&self, error_code: u64) {
        self.receiver.stop_sending(error_code);
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.receiver.detach_reader();
    }
}
