//! Recovery coordinator
//!
//! Recovery algorithm:
//! 1. Load the MANIFEST (or create one for a fresh directory): watermark W
//!    and the live layers
//! 2. Delete layer files the MANIFEST does not reference (orphans)
//! 3. Load every live layer, validating checksums and headers
//! 4. Truncate a torn record at the WAL tail
//! 5. Replay WAL records with lsn > W, in order
//!
//! Steps 1-3 happen in [`RecoveryCoordinator::open`], steps 4-5 in
//! [`RecoveryPlan::replay`], so the caller can report the Replaying phase
//! in between.
//!
//! # Recovery Properties
//!
//! - **Deterministic**: Same inputs -> same state
//! - **Idempotent**: Recovering twice without new writes yields the same state
//! - **Fail-stop**: A corrupted MANIFEST or live layer aborts recovery; it is
//!   never repaired automatically

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pagestore_core::{Lsn, MutationRecord};
use tracing::{info, warn};

use crate::format::{parse_layer_name, ManifestError, WalSegment};
use crate::layer_store::{DiskLayer, LayerStore, LayerStoreError};
use crate::paths::DatabasePaths;
use crate::wal::{list_segments, WalReader, WalReaderError};

/// What a recovery run found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Watermark read from the MANIFEST
    pub durable_watermark: Lsn,
    /// Live layers loaded
    pub live_layers: usize,
    /// Unreferenced layer files deleted
    pub orphans_removed: usize,
    /// WAL segments read
    pub wal_segments: usize,
    /// WAL records read
    pub records_read: usize,
    /// Records at or below the watermark, already in layers
    pub records_skipped: usize,
    /// Records replayed into memory
    pub records_replayed: usize,
    /// Bytes cut from a torn WAL tail
    pub truncated_bytes: u64,
    /// Highest position recovered (layers or WAL)
    pub last_record_lsn: Lsn,
    /// True when the data directory was initialized by this run
    pub fresh: bool,
    /// Wall time spent recovering
    pub duration: Duration,
}

/// Recovery coordinator
pub struct RecoveryCoordinator {
    paths: DatabasePaths,
}

impl RecoveryCoordinator {
    /// Create a coordinator for a data directory
    pub fn new(paths: DatabasePaths) -> Self {
        RecoveryCoordinator { paths }
    }

    /// Load the MANIFEST and live layers, removing orphans
    pub fn open(&self) -> Result<RecoveryPlan, RecoveryError> {
        let started = Instant::now();
        self.paths.create_directories()?;
        let mut stats = RecoveryStats::default();

        let store = if self.paths.exists() {
            LayerStore::load(&self.paths)?
        } else {
            self.check_never_checkpointed()?;
            stats.fresh = true;
            let uuid = self.adopt_wal_uuid()?.unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes());
            LayerStore::create(&self.paths, uuid)?
        };

        let stale_temp = self.paths.manifest().with_extension("tmp");
        if stale_temp.exists() {
            std::fs::remove_file(&stale_temp)?;
        }

        stats.durable_watermark = store.durable_watermark();
        stats.orphans_removed = store.remove_orphans()?.len();

        let mut layers = Vec::new();
        for entry in store.list_live_layers() {
            layers.push(Arc::new(store.open_layer(&entry)?));
        }
        stats.live_layers = layers.len();
        stats.last_record_lsn = stats.durable_watermark;

        info!(
            target: "pagestore::recovery",
            watermark = %stats.durable_watermark,
            live_layers = stats.live_layers,
            orphans_removed = stats.orphans_removed,
            fresh = stats.fresh,
            "Loaded MANIFEST"
        );

        Ok(RecoveryPlan {
            wal_dir: self.paths.wal_dir(),
            store,
            layers,
            stats,
            started,
        })
    }

    /// Refuse to initialize over a directory that has checkpointed before
    ///
    /// Layer files, or a WAL whose first segments were compacted away, mean
    /// a MANIFEST was published here once. Starting fresh would delete those
    /// layers as orphans.
    fn check_never_checkpointed(&self) -> Result<(), RecoveryError> {
        let mut layer_files = 0usize;
        for entry in std::fs::read_dir(self.paths.layers_dir())? {
            let entry = entry?;
            if entry.file_name().to_str().and_then(parse_layer_name).is_some() {
                layer_files += 1;
            }
        }
        if layer_files > 0 {
            return Err(RecoveryError::ManifestMissing(format!(
                "{} layer file(s) present",
                layer_files
            )));
        }

        if let Some(&first) = list_segments(&self.paths.wal_dir())?.first() {
            if first > 1 {
                return Err(RecoveryError::ManifestMissing(format!(
                    "WAL starts at segment {}",
                    first
                )));
            }
        }
        Ok(())
    }

    /// UUID of existing WAL segments, for a directory that lost no MANIFEST
    /// writes but never had one (crash during first start)
    fn adopt_wal_uuid(&self) -> Result<Option<[u8; 16]>, RecoveryError> {
        let wal_dir = self.paths.wal_dir();
        match list_segments(&wal_dir)?.first() {
            Some(&first) => {
                let segment = WalSegment::open_read(&wal_dir, first).map_err(|e| {
                    RecoveryError::Wal(WalReaderError::Segment {
                        segment: first,
                        detail: e.to_string(),
                    })
                })?;
                Ok(Some(segment.database_uuid()))
            }
            None => Ok(None),
        }
    }
}

/// MANIFEST and layers loaded, WAL not yet replayed
pub struct RecoveryPlan {
    wal_dir: std::path::PathBuf,
    store: LayerStore,
    layers: Vec<Arc<DiskLayer>>,
    stats: RecoveryStats,
    started: Instant,
}

impl RecoveryPlan {
    /// Durable watermark from the MANIFEST
    pub fn durable_watermark(&self) -> Lsn {
        self.stats.durable_watermark
    }

    /// Live layers in position order
    pub fn layers(&self) -> &[Arc<DiskLayer>] {
        &self.layers
    }

    /// Replay WAL records beyond the watermark through `on_record`
    ///
    /// Records arrive in increasing position order. A torn tail on the
    /// last segment is truncated first.
    pub fn replay<F>(mut self, mut on_record: F) -> Result<RecoveryResult, RecoveryError>
    where
        F: FnMut(MutationRecord) -> Result<(), pagestore_core::Error>,
    {
        let database_uuid = self.store.database_uuid();
        check_segment_ownership(&self.wal_dir, database_uuid)?;

        let read = WalReader::new().read_all(&self.wal_dir)?;
        if let Some(truncate) = &read.truncate_info {
            warn!(
                target: "pagestore::recovery",
                segment = truncate.segment_number,
                bytes = truncate.bytes_to_truncate(),
                reason = ?read.stop_reason,
                "Truncating WAL after its last valid record"
            );
            truncate.apply(&self.wal_dir)?;
            self.stats.truncated_bytes = truncate.bytes_to_truncate();
        }

        let watermark = self.stats.durable_watermark;
        let mut last = watermark;
        self.stats.wal_segments = read.segments.len();
        self.stats.records_read = read.records.len();

        for record in read.records {
            if record.lsn <= watermark {
                self.stats.records_skipped += 1;
                continue;
            }
            if record.lsn <= last {
                return Err(RecoveryError::OutOfOrder {
                    previous: last,
                    got: record.lsn,
                });
            }
            last = record.lsn;
            on_record(record.into())?;
            self.stats.records_replayed += 1;
        }

        self.stats.last_record_lsn = last;
        self.stats.duration = self.started.elapsed();

        info!(
            target: "pagestore::recovery",
            watermark = %watermark,
            last_record_lsn = %last,
            replayed = self.stats.records_replayed,
            skipped = self.stats.records_skipped,
            truncated_bytes = self.stats.truncated_bytes,
            duration_ms = self.stats.duration.as_millis() as u64,
            "Recovery complete"
        );

        Ok(RecoveryResult {
            store: self.store,
            layers: self.layers,
            stats: self.stats,
        })
    }
}

fn check_segment_ownership(wal_dir: &Path, database_uuid: [u8; 16]) -> Result<(), RecoveryError> {
    for segment_number in list_segments(wal_dir)? {
        let segment = WalSegment::open_read(wal_dir, segment_number).map_err(|e| {
            RecoveryError::Wal(WalReaderError::Segment {
                segment: segment_number,
                detail: e.to_string(),
            })
        })?;
        if segment.database_uuid() != database_uuid {
            return Err(RecoveryError::ForeignSegment(segment_number));
        }
    }
    Ok(())
}

/// Recovered state, ready to serve
pub struct RecoveryResult {
    /// Layer store over the loaded MANIFEST
    pub store: LayerStore,
    /// Live layers in position order
    pub layers: Vec<Arc<DiskLayer>>,
    /// Statistics
    pub stats: RecoveryStats,
}

/// Recovery errors
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// MANIFEST or layer problem
    #[error("Layer store error: {0}")]
    Store(#[from] LayerStoreError),

    /// WAL could not be read
    #[error("WAL read error: {0}")]
    Wal(#[from] WalReaderError),

    /// No MANIFEST, but the directory holds checkpointed state
    #[error("MANIFEST missing from a directory that has checkpointed: {0}")]
    ManifestMissing(String),

    /// A WAL segment belongs to another data directory
    #[error("WAL segment {0} belongs to a different database")]
    ForeignSegment(u64),

    /// Replayable WAL records are not strictly increasing
    #[error("WAL records out of order: {got} after {previous}")]
    OutOfOrder {
        /// Previous position
        previous: Lsn,
        /// Offending position
        got: Lsn,
    },

    /// The replay callback rejected a record
    #[error("Replay failed: {0}")]
    Apply(#[from] pagestore_core::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ManifestError> for RecoveryError {
    fn from(err: ManifestError) -> Self {
        RecoveryError::Store(LayerStoreError::Manifest(err))
    }
}

impl From<RecoveryError> for pagestore_core::Error {
    fn from(err: RecoveryError) -> Self {
        use pagestore_core::Error;
        match err {
            RecoveryError::Store(e) => e.into(),
            RecoveryError::Apply(e) => e,
            RecoveryError::Io(e) => Error::IoError(e),
            e @ RecoveryError::ManifestMissing(_) => Error::ManifestCorrupted(e.to_string()),
            e @ (RecoveryError::Wal(_)
            | RecoveryError::ForeignSegment(_)
            | RecoveryError::OutOfOrder { .. }) => Error::corruption(e.to_string()),
        }
    }
}
