//! # Stream Creation Permit (RFC 9000 Section 4.6)
//!
//! The peer bounds how many streams of each type we may open through
//! MAX_STREAMS. A [`StreamCreationPermit`] is the local admission control for
//! one (initiator, direction) class: every stream opened takes one permit
//! for good, and the limit only grows.
//!
//! Callers that cannot get a permit right away queue a waiter. Waiters are
//! served in FIFO order whenever the limit increases. Servicing is
//! coalesced through a [`SequentialRunner`], so concurrent limit increases
//! never run overlapping passes.
//!
//! A waiter that times out (or is cancelled) leaves the queue right away.
//! If it was granted at that same moment, it is no longer queued; it then
//! closes its channel and checks for the grant that slipped in, handing the
//! permit back and servicing the queue again. Every grant is therefore
//! either used or released exactly once.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::sequential::SequentialRunner;
use crate::types::StreamDirection;
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::{debug, trace};

#[derive(Debug)]
struct PermitState {
    acquired: u64,
    limit: u64,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    terminated: Option<String>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

/// Admission control for locally opened streams of one type.
#[derive(Debug)]
pub struct StreamCreationPermit {
    direction: StreamDirection,
    state: Mutex<PermitState>,
    runner: SequentialRunner,
}

impl StreamCreationPermit {
    pub fn new(direction: StreamDirection, limit: u64) -> Self {
        Self {
            direction,
            state: Mutex::new(PermitState {
                acquired: 0,
                limit,
                waiters: VecDeque::new(),
                next_waiter: 0,
                terminated: None,
            }),
            runner: SequentialRunner::new(),
        }
    }

    /// Current limit (the peer's MAX_STREAMS for this type)
    pub fn limit(&self) -> u64 {
        self.state.lock().limit
    }

    /// Permits handed out so far
    pub fn acquired(&self) -> u64 {
        self.state.lock().acquired
    }

    /// Callers queued for a permit
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Take a permit if one is free, without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut st = self.state.lock();
        if st.terminated.is_some() || st.acquired >= st.limit {
            return false;
        }
        st.acquired += 1;
        true
    }

    /// Take a permit, waiting up to `timeout` for the limit to grow.
    ///
    /// Fails with [`Error::StreamLimit`] on timeout and with
    /// [`Error::ConnectionClosed`] if the connection terminates first.
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        if self.try_acquire() {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut st = self.state.lock();
            if let Some(reason) = &st.terminated {
                return Err(Error::connection_closed(reason.clone()));
            }
            let id = st.next_waiter;
            st.next_waiter += 1;
            st.waiters.push_back(Waiter { id, grant: tx });
            id
        };
        // The limit may have grown since try_acquire
        self.service_waiters();

        let mut pending = PendingAcquire {
            permit: self,
            id,
            rx,
            settled: false,
        };
        match tokio::time::timeout(timeout, &mut pending.rx).await {
            Ok(Ok(())) => {
                pending.settled = true;
                Ok(())
            }
            Ok(Err(_)) => {
                pending.settled = true;
                Err(self.closed_error())
            }
            Err(_) => {
                debug!(direction = ?self.direction, ?timeout, "stream permit timed out");
                Err(Error::StreamLimit { timeout })
            }
        }
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .state
            .lock()
            .terminated
            .clone()
            .unwrap_or_else(|| "stream permits terminated".to_string());
        Error::connection_closed(reason)
    }

    /// Raise the limit to `limit`. Returns false if it is not higher than
    /// the current one.
    pub fn try_increase_limit_to(&self, limit: u64) -> bool {
        {
            let mut st = self.state.lock();
            if limit <= st.limit {
                return false;
            }
            trace!(direction = ?self.direction, from = st.limit, to = limit, "stream limit raised");
            st.limit = limit;
        }
        self.service_waiters();
        true
    }

    /// Hand back a permit that was granted to a waiter that gave up.
    fn release(&self) {
        {
            let mut st = self.state.lock();
            st.acquired = st.acquired.saturating_sub(1);
        }
        self.service_waiters();
    }

    fn service_waiters(&self) {
        self.runner.run_or_schedule(|| {
            let mut st = self.state.lock();
            while st.acquired < st.limit {
                let Some(waiter) = st.waiters.pop_front() else {
                    break;
                };
                st.acquired += 1;
                if waiter.grant.send(()).is_err() {
                    // Waiter already gone
                    st.acquired -= 1;
                }
            }
        });
    }

    /// Fail every waiter and refuse further acquisitions.
    pub fn terminate(&self, reason: &str) {
        let waiters = {
            let mut st = self.state.lock();
            st.terminated.get_or_insert_with(|| reason.to_string());
            std::mem::take(&mut st.waiters)
        };
        // Dropping the senders wakes every waiter
        drop(waiters);
    }
}

/// A queued acquisition. Releases a grant that arrives after the caller
/// stopped waiting.
struct PendingAcquire<'a> {
    permit: &'a StreamCreationPermit,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        {
            let mut st = self.permit.state.lock();
            if let Some(pos) = st.waiters.iter().position(|w| w.id == self.id) {
                // Still queued, so never granted
                st.waiters.remove(pos);
                return;
            }
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            trace!(direction = ?self.permit.direction, "returning late stream permit");
            self.permit.release();
        }
    }
}
