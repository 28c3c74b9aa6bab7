//! Durable watermark published to waiters
//!
//! The Layer Store's MANIFEST is the source of truth; this is the
//! in-process mirror ingestion callers block on to learn that their
//! mutation has become durable.

use std::time::{Duration, Instant};

use pagestore_core::Lsn;
use parking_lot::{Condvar, Mutex};

/// Highest position covered by published layers
#[derive(Debug)]
pub struct DurableWatermark {
    lsn: Mutex<Lsn>,
    advanced: Condvar,
}

impl DurableWatermark {
    /// Start at `lsn`
    pub fn new(lsn: Lsn) -> Self {
        DurableWatermark {
            lsn: Mutex::new(lsn),
            advanced: Condvar::new(),
        }
    }

    /// Current value
    pub fn get(&self) -> Lsn {
        *self.lsn.lock()
    }

    /// Raise the watermark and wake every waiter. Lower values are ignored.
    pub fn advance(&self, lsn: Lsn) {
        let mut current = self.lsn.lock();
        if lsn > *current {
            *current = lsn;
            self.advanced.notify_all();
        }
    }

    /// Block until the watermark reaches `target` or `timeout` elapses.
    ///
    /// Returns the watermark seen last; the caller compares it to `target`.
    pub fn wait_for(&self, target: Lsn, timeout: Duration) -> Lsn {
        let deadline = Instant::now() + timeout;
        let mut current = self.lsn.lock();
        while *current < target {
            if self.advanced.wait_until(&mut current, deadline).timed_out() {
                break;
            }
        }
        *current
    }
}
