//! Application-facing write handle.

#![forbid(unsafe_code)]

use crate::error::Result;
use crate::stream::sender::SenderStream;
use crate::stream::state::SendingState;
use crate::types::StreamId;
use bytes::Bytes;
use std::sync::Arc;

/// Writes to the sending half of a stream.
///
/// At most one writer is attached to a stream at a time. Dropping the
/// writer detaches it without finishing the stream; call
/// [`StreamWriter::finish`] or [`StreamWriter::reset`] first.
#[derive(Debug)]
pub struct StreamWriter {
    sender: Arc<SenderStream>,
}

impl StreamWriter {
    pub(crate) fn attach(sender: Arc<SenderStream>) -> Self {
        sender.attach_writer();
        Self { sender }
    }

    pub fn stream_id(&self) -> StreamId {
        self.sender.id()
    }

    pub fn state(&self) -> SendingState {
        self.sender.state()
    }

    /// Bytes that can be written before the stream asks the writer to wait.
    pub fn credit(&self) -> Result<u64> {
        self.sender.writer_capacity()
    }

    /// Queue `data` without waiting, regardless of buffer space.
    pub fn schedule_write(&self, data: Bytes, is_last: bool) -> Result<()> {
        self.sender.submit(data, is_last)
    }

    /// Wait for buffer space, then queue `data`.
    pub async fn write(&self, data: Bytes, is_last: bool) -> Result<()> {
        self.sender.wait_for_capacity().await?;
        self.sender.submit(data, is_last)
    }

    /// Write `data` in pieces no larger than the available buffer space.
    pub async fn write_all(&self, mut data: Bytes, is_last: bool) -> Result<()> {
        if data.is_empty() {
            return if is_last { self.finish() } else { Ok(()) };
        }
        while !data.is_empty() {
            let capacity = self.sender.wait_for_capacity().await?;
            let n = data.len().min(capacity as usize);
            let piece = data.split_to(n);
            self.sender.submit(piece, is_last && data.is_empty())?;
        }
        Ok(())
    }

    /// End the stream after the data already written.
    pub fn finish(&self) -> Result<()> {
        self.sender.submit(Bytes::new(), true)
    }

    /// Abandon the stream, sending RESET_STREAM with `error_code`.
    pub fn reset(&self, error_code: u64) {
        self.sender.reset(error_code);
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.sender.detach_writer();
    }
}
