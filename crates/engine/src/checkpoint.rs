//! Checkpoint engine
//!
//! Turns the active in-memory layer into a published on-disk layer:
//!
//! 1. Freeze the active layer (ingestion continues into a fresh one)
//! 2. Write the frozen records, key ordered, to a new layer file
//! 3. Failpoint `checkpoint-before-sync`
//! 4. fsync the layer file and its directory
//! 5. Failpoint `checkpoint-after-sync`
//! 6. Publish: atomic MANIFEST replace, watermark advance
//! 7. Swap the frozen layer for the on-disk one in the layer map
//! 8. Remove WAL segments the new watermark covers
//!
//! A failure in steps 2-6 keeps the frozen layer in the map and visible to
//! readers. The next attempt writes the same frozen layer to a new file.
//!
//! Checkpoints never overlap. `run` waits for an in-flight checkpoint and
//! then runs its own; `try_run` gives up instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use pagestore_core::{Error, LayerRead, LsnRange, MutationRecord, Result};
use pagestore_durability::{
    FailpointRegistry, LayerHandle, LayerStore, LayerStoreError, WalCompactor,
    CHECKPOINT_AFTER_SYNC, CHECKPOINT_BEFORE_SYNC,
};
use pagestore_storage::{FrozenLayer, LayerMap};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::server::DurableWatermark;

/// Result of one checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// Nothing was waiting to be checkpointed
    Empty,
    /// A layer was published
    Published {
        /// New layer id
        layer_id: u64,
        /// Positions the layer covers; `range.end` is the new watermark
        range: LsnRange,
        /// Distinct keys written
        entries: u64,
        /// WAL segments removed afterwards
        wal_segments_removed: usize,
    },
}

/// The state a checkpoint reads and updates
pub struct CheckpointTarget<'a> {
    /// Live layers
    pub layers: &'a RwLock<LayerMap>,
    /// On-disk layers and MANIFEST
    pub store: &'a LayerStore,
    /// In-process mirror of the durable watermark
    pub watermark: &'a DurableWatermark,
}

/// Runs checkpoints one at a time
pub struct CheckpointEngine {
    running: Mutex<()>,
    failpoints: Option<Arc<FailpointRegistry>>,
    compactor: WalCompactor,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl CheckpointEngine {
    /// Create an engine. Failpoints are consulted only when a registry is
    /// given.
    pub fn new(compactor: WalCompactor, failpoints: Option<Arc<FailpointRegistry>>) -> Self {
        CheckpointEngine {
            running: Mutex::new(()),
            failpoints,
            compactor,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Run a checkpoint, first waiting for any in-flight one to finish
    ///
    /// `active_segment` reports the WAL segment ingestion appends to; it is
    /// only called after a layer has been published.
    pub fn run(
        &self,
        target: &CheckpointTarget<'_>,
        active_segment: impl FnOnce() -> u64,
    ) -> Result<CheckpointOutcome> {
        let _running = self.running.lock();
        self.run_locked(target, active_segment)
    }

    /// Run a checkpoint unless one is already in flight
    ///
    /// Returns `None` when the request coalesced into the running checkpoint.
    pub fn try_run(
        &self,
        target: &CheckpointTarget<'_>,
        active_segment: impl FnOnce() -> u64,
    ) -> Option<Result<CheckpointOutcome>> {
        let _running = self.running.try_lock()?;
        Some(self.run_locked(target, active_segment))
    }

    /// Checkpoints that published a layer
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Checkpoint attempts that failed
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn run_locked(
        &self,
        target: &CheckpointTarget<'_>,
        active_segment: impl FnOnce() -> u64,
    ) -> Result<CheckpointOutcome> {
        let start = Instant::now();

        let Some(frozen) = target.layers.write().freeze() else {
            debug!(target: "pagestore::checkpoint", "Nothing to checkpoint");
            return Ok(CheckpointOutcome::Empty);
        };
        let Some(range) = frozen.lsn_range() else {
            return Ok(CheckpointOutcome::Empty);
        };

        let handle = match self.persist(&frozen, range, target.store) {
            Ok(handle) => handle,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "pagestore::checkpoint",
                    range = %range,
                    error = %e,
                    "Checkpoint failed, frozen layer kept for retry"
                );
                return Err(e.into());
            }
        };

        let layer_id = handle.layer_id();
        let entries = handle.entry_count();
        let records: Vec<MutationRecord> = frozen.iter().cloned().collect();
        let disk: Arc<dyn LayerRead> = Arc::new(handle.into_disk_layer(records));
        target.layers.write().complete_checkpoint(&frozen, disk);
        target.watermark.advance(range.end);
        self.completed.fetch_add(1, Ordering::Relaxed);

        let wal_segments_removed = match self.compactor.compact(range.end, active_segment()) {
            Ok(info) => info.wal_segments_removed,
            Err(e) => {
                warn!(target: "pagestore::compaction", error = %e, "WAL compaction failed");
                0
            }
        };

        info!(
            target: "pagestore::checkpoint",
            layer_id,
            entries,
            appends = frozen.appends(),
            watermark = %range.end,
            wal_segments_removed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Checkpoint completed"
        );

        Ok(CheckpointOutcome::Published {
            layer_id,
            range,
            entries,
            wal_segments_removed,
        })
    }

    /// Steps 2-6. The layer file is removed when a step before publish
    /// fails. A failed publish leaves it for recovery to clean up, since
    /// the MANIFEST may already name it.
    fn persist(
        &self,
        frozen: &FrozenLayer,
        range: LsnRange,
        store: &LayerStore,
    ) -> std::result::Result<LayerHandle, CheckpointError> {
        let mut handle = store.append_layer(frozen.iter(), frozen.len() as u64, range)?;

        let synced = self
            .fire(CHECKPOINT_BEFORE_SYNC)
            .and_then(|()| store.sync_layer(&mut handle).map_err(CheckpointError::from))
            .and_then(|()| self.fire(CHECKPOINT_AFTER_SYNC));
        if let Err(e) = synced {
            store.discard(handle);
            return Err(e);
        }

        store.publish(&handle, range.end)?;
        Ok(handle)
    }

    fn fire(&self, name: &'static str) -> std::result::Result<(), CheckpointError> {
        match &self.failpoints {
            Some(registry) => registry
                .fire(name)
                .map_err(|source| CheckpointError::Injected { name, source }),
            None => Ok(()),
        }
    }
}

/// Checkpoint errors
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Writing, syncing or publishing the layer failed
    #[error("{0}")]
    Store(#[from] LayerStoreError),

    /// A failpoint returned an error
    #[error("failpoint {name}: {source}")]
    Injected {
        /// Failpoint name
        name: &'static str,
        /// Injected error
        source: std::io::Error,
    },
}

impl From<CheckpointError> for Error {
    fn from(err: CheckpointError) -> Self {
        let detail = err.to_string();
        match err {
            CheckpointError::Store(e) => match Error::from(e) {
                fatal if fatal.is_fatal() => fatal,
                _ => Error::CheckpointFailed(detail),
            },
            CheckpointError::Injected { .. } => Error::CheckpointFailed(detail),
        }
    }
}
