//! Coalescing "run or schedule" runner.
//!
//! Several threads may request the same maintenance pass at once (for
//! example, servicing permit waiters after concurrent limit increases). The
//! runner guarantees that at most one pass executes at a time and that every
//! request is covered by a pass that started after it was made. Requests
//! arriving while a pass is running are folded into one extra pass run by the
//! thread already running, so callers never wait on each other.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct SequentialRunner {
    /// Requests not yet retired by a completed pass. Non-zero means some
    /// thread owns the runner.
    requests: AtomicUsize,
}

impl SequentialRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `pass` now, or leave it to the thread currently running.
    ///
    /// Returns true if the calling thread executed at least one pass.
    pub fn run_or_schedule(&self, mut pass: impl FnMut()) -> bool {
        if self.requests.fetch_add(1, Ordering::AcqRel) != 0 {
            return false;
        }

        loop {
            let observed = self.requests.load(Ordering::Acquire);
            pass();
            if self
                .requests
                .compare_exchange(observed, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// True while a pass is executing or pending.
    pub fn is_running(&self) -> bool {
        self.requests.load(Ordering::Acquire) != 0
    }
}
