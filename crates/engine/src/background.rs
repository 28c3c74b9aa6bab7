//! Background workers
//!
//! Two named threads run next to ingestion:
//!
//! - `pagestore-checkpointer`: checkpoints when ingestion crosses
//!   `checkpoint_distance`, when `checkpoint_interval_ms` passes with data
//!   waiting, and retries failed checkpoints after a backoff
//! - `pagestore-wal-flush`: fsyncs the WAL every `wal_flush_interval_ms`
//!   in Standard durability mode
//!
//! Both stop when `BackgroundWorkers::stop` raises the shutdown flag and
//! wakes them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use pagestore_core::{Error, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::server::Shared;

/// Idle poll when no timer is configured
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Shutdown flag plus a wakeup for checkpoint requests
#[derive(Default)]
pub(crate) struct BackgroundSignal {
    shutdown: AtomicBool,
    checkpoint_requested: Mutex<bool>,
    wake: Condvar,
}

impl BackgroundSignal {
    /// Ask the checkpointer for a checkpoint
    pub(crate) fn request_checkpoint(&self) {
        let mut requested = self.checkpoint_requested.lock();
        if !*requested {
            *requested = true;
            self.wake.notify_all();
        }
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _guard = self.checkpoint_requested.lock();
        self.wake.notify_all();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Wait up to `timeout` for a request; returns and clears it
    fn wait_for_request(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = self.checkpoint_requested.lock();
        while !*requested && !self.is_shutdown() {
            if self.wake.wait_until(&mut requested, deadline).timed_out() {
                break;
            }
        }
        std::mem::take(&mut *requested)
    }

    /// Sleep up to `timeout`; returns true when shutting down
    fn sleep(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = self.checkpoint_requested.lock();
        while !self.is_shutdown() {
            if self.wake.wait_until(&mut requested, deadline).timed_out() {
                break;
            }
        }
        self.is_shutdown()
    }
}

/// Timing knobs for the checkpointer
#[derive(Debug, Clone, Copy)]
pub(crate) struct CheckpointSchedule {
    pub(crate) interval: Option<Duration>,
    pub(crate) retry_backoff: Duration,
    pub(crate) distance_enabled: bool,
}

impl CheckpointSchedule {
    fn enabled(&self) -> bool {
        self.distance_enabled || self.interval.is_some()
    }
}

/// Running background threads
pub(crate) struct BackgroundWorkers {
    signal: Arc<BackgroundSignal>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundWorkers {
    /// Spawn the threads the configuration asks for
    pub(crate) fn spawn(
        shared: &Arc<Shared>,
        signal: Arc<BackgroundSignal>,
        schedule: CheckpointSchedule,
        wal_flush_interval: Option<Duration>,
    ) -> Result<Self> {
        let mut workers = BackgroundWorkers {
            signal,
            handles: Vec::new(),
        };

        if schedule.enabled() {
            let shared = Arc::clone(shared);
            let signal = Arc::clone(&workers.signal);
            let handle = std::thread::Builder::new()
                .name("pagestore-checkpointer".to_string())
                .spawn(move || checkpointer_loop(&shared, &signal, schedule))
                .map_err(|e| spawn_error("checkpointer", e));
            workers.push(handle)?;
        }

        if let Some(interval) = wal_flush_interval {
            let shared = Arc::clone(shared);
            let signal = Arc::clone(&workers.signal);
            let handle = std::thread::Builder::new()
                .name("pagestore-wal-flush".to_string())
                .spawn(move || flusher_loop(&shared, &signal, interval))
                .map_err(|e| spawn_error("WAL flush", e));
            workers.push(handle)?;
        }

        Ok(workers)
    }

    fn push(&mut self, handle: Result<JoinHandle<()>>) -> Result<()> {
        match handle {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.stop();
                Err(e)
            }
        }
    }

    /// Signal shutdown and join every thread
    pub(crate) fn stop(&mut self) {
        self.signal.shutdown();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(target: "pagestore::server", "Background thread panicked");
            }
        }
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_error(what: &str, e: std::io::Error) -> Error {
    Error::storage(format!("failed to spawn {} thread: {}", what, e))
}

fn checkpointer_loop(shared: &Shared, signal: &BackgroundSignal, schedule: CheckpointSchedule) {
    let poll = schedule.interval.map_or(IDLE_POLL, |i| i.min(IDLE_POLL));
    let mut last_checkpoint = Instant::now();
    let mut wait = poll;

    loop {
        let requested = signal.wait_for_request(wait);
        if signal.is_shutdown() {
            break;
        }

        let due = schedule
            .interval
            .map_or(false, |interval| last_checkpoint.elapsed() >= interval);
        let retry = shared.has_pending_frozen();
        if !(requested || due || retry) {
            continue;
        }
        if !shared.has_unpublished_data() {
            last_checkpoint = Instant::now();
            continue;
        }

        match shared.try_checkpoint() {
            None => debug!(target: "pagestore::checkpoint", "Checkpoint already running"),
            Some(Ok(_)) => {
                last_checkpoint = Instant::now();
                wait = poll;
            }
            Some(Err(e)) => {
                if e.is_fatal() {
                    error!(
                        target: "pagestore::checkpoint",
                        error = %e,
                        "Background checkpoint hit unrecoverable error"
                    );
                } else {
                    warn!(
                        target: "pagestore::checkpoint",
                        error = %e,
                        backoff_ms = schedule.retry_backoff.as_millis() as u64,
                        "Background checkpoint failed, will retry"
                    );
                }
                wait = schedule.retry_backoff;
            }
        }
    }
    debug!(target: "pagestore::checkpoint", "Checkpointer stopped");
}

fn flusher_loop(shared: &Shared, signal: &BackgroundSignal, interval: Duration) {
    while !signal.sleep(interval) {
        if let Err(e) = shared.sync_wal_if_overdue() {
            warn!(target: "pagestore::wal", error = %e, "Background WAL sync failed");
        }
    }
    debug!(target: "pagestore::wal", "WAL flush thread stopped");
}
