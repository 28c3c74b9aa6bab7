//! Page server
//!
//! `PageServer` ties the pieces together:
//!
//! - ingestion: WAL append, then insert into the active in-memory layer
//! - reads: point and range lookups merged across every live layer
//! - checkpoints: explicit (`checkpoint`) or from the background thread
//! - lifecycle: `start` recovers and serves, `stop` halts ingestion and
//!   background work
//!
//! # Lock order
//!
//! `ingest` before `layers`. The checkpoint engine takes `layers` and
//! `ingest` one at a time, never nested.

mod config;
mod watermark;

pub use config::{ConfigError, PageServerConfig, CONFIG_FILE_NAME};
pub use watermark::DurableWatermark;

use std::fmt;
use std::fs::File;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use pagestore_core::{key_bounds, Error, Key, LayerRead, Lsn, MutationRecord, Result};
use pagestore_durability::format::{WalRecord, MAX_RECORD_LEN};
use pagestore_durability::{
    DatabasePaths, DurabilityMode, FailpointRegistry, LayerStore, ManifestLayer,
    RecoveryCoordinator, RecoveryStats, WalCompactor, WalWriter,
};
use pagestore_storage::{LayerMap, LayerSummary};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::background::{BackgroundSignal, BackgroundWorkers, CheckpointSchedule};
use crate::checkpoint::{CheckpointEngine, CheckpointOutcome, CheckpointTarget};

/// Lifecycle state. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    /// Loading the MANIFEST and live layers
    Starting,
    /// Replaying WAL records beyond the durable watermark
    Replaying,
    /// Accepting ingestion and reads
    Serving,
    /// Stopped; a new `start` is needed
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Starting => "starting",
            ServerState::Replaying => "replaying",
            ServerState::Serving => "serving",
            ServerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Forward-only state holder
#[derive(Debug)]
struct StateCell {
    state: Mutex<ServerState>,
}

impl StateCell {
    fn new() -> Self {
        debug!(target: "pagestore::server", state = %ServerState::Starting, "Server state");
        StateCell {
            state: Mutex::new(ServerState::Starting),
        }
    }

    fn get(&self) -> ServerState {
        *self.state.lock()
    }

    /// Move to `next`. Returns false if that would go backwards or stay put.
    fn advance(&self, next: ServerState) -> bool {
        let mut state = self.state.lock();
        if next <= *state {
            return false;
        }
        info!(
            target: "pagestore::server",
            from = %*state,
            to = %next,
            "Server state changed"
        );
        *state = next;
        true
    }
}

/// WAL writer plus the last accepted position, guarded together so that
/// ordering check, WAL append and layer insert happen as one step
struct IngestLog {
    wal: WalWriter,
    last_lsn: Lsn,
}

/// State shared with the background threads
pub(crate) struct Shared {
    state: StateCell,
    ingest: Mutex<IngestLog>,
    layers: RwLock<LayerMap>,
    store: LayerStore,
    checkpoint: CheckpointEngine,
    watermark: DurableWatermark,
}

impl Shared {
    fn target(&self) -> CheckpointTarget<'_> {
        CheckpointTarget {
            layers: &self.layers,
            store: &self.store,
            watermark: &self.watermark,
        }
    }

    fn active_segment(&self) -> u64 {
        self.ingest.lock().wal.current_segment()
    }

    pub(crate) fn try_checkpoint(&self) -> Option<Result<CheckpointOutcome>> {
        self.checkpoint
            .try_run(&self.target(), || self.active_segment())
    }

    pub(crate) fn has_pending_frozen(&self) -> bool {
        self.layers.read().pending_frozen().is_some()
    }

    pub(crate) fn has_unpublished_data(&self) -> bool {
        let layers = self.layers.read();
        layers.pending_frozen().is_some() || layers.active_appends() > 0
    }

    pub(crate) fn sync_wal_if_overdue(&self) -> std::io::Result<bool> {
        self.ingest.lock().wal.sync_if_overdue()
    }
}

/// A running page server over one data directory
///
/// Holds an exclusive lock on the directory for its lifetime.
///
/// # Example
///
/// ```text
/// let server = PageServer::start("/data/pages")?;
/// let lsn = server.ingest(MutationRecord::new("page-1", b"contents".to_vec(), 1))?;
/// server.checkpoint()?;
/// server.wait_for_durable(lsn, Duration::from_secs(5))?;
/// ```
pub struct PageServer {
    paths: DatabasePaths,
    config: PageServerConfig,
    shared: Arc<Shared>,
    signal: Arc<BackgroundSignal>,
    background: Mutex<Option<BackgroundWorkers>>,
    recovery_stats: RecoveryStats,
    _lock_file: File,
}

impl PageServer {
    /// Start a server at `path`, reading `pagestore.toml` from it
    ///
    /// A default `pagestore.toml` is written on first start. No failpoints
    /// are consulted.
    pub fn start<P: AsRef<Path>>(path: P) -> Result<Self> {
        let paths = DatabasePaths::from_root(path.as_ref());
        std::fs::create_dir_all(paths.root())?;
        let config_path = paths.config();
        PageServerConfig::write_default_if_missing(&config_path)?;
        let config = PageServerConfig::from_file(&config_path)?;
        Self::start_with(path, config, None)
    }

    /// Start a server with an explicit configuration and, for tests, a
    /// failpoint registry consulted by the checkpoint engine
    ///
    /// # Flow
    ///
    /// 1. Lock the data directory
    /// 2. Starting: load MANIFEST and live layers, delete orphans
    /// 3. Replaying: replay WAL records beyond the watermark
    /// 4. Serving: open the WAL for append, spawn background threads
    pub fn start_with<P: AsRef<Path>>(
        path: P,
        config: PageServerConfig,
        failpoints: Option<Arc<FailpointRegistry>>,
    ) -> Result<Self> {
        config.validate()?;
        let durability = config.durability_mode()?;
        let wal_config = config.wal_config()?;

        let paths = DatabasePaths::from_root(path.as_ref());
        std::fs::create_dir_all(paths.root())?;
        let lock_file = lock_data_dir(&paths)?;

        let state = StateCell::new();
        let plan = RecoveryCoordinator::new(paths.clone()).open()?;
        let watermark = plan.durable_watermark();
        let historic: Vec<Arc<dyn LayerRead>> = plan
            .layers()
            .iter()
            .map(|layer| Arc::clone(layer) as Arc<dyn LayerRead>)
            .collect();
        let mut layers = LayerMap::with_historic(historic, watermark);

        state.advance(ServerState::Replaying);
        let recovered = plan.replay(|record| layers.insert(record))?;
        let recovery_stats = recovered.stats;
        let store = recovered.store;
        let last_lsn = layers.last_lsn();

        let wal = WalWriter::open(paths.wal_dir(), store.database_uuid(), durability, wal_config)?;

        let checkpoint = CheckpointEngine::new(WalCompactor::new(paths.wal_dir()), failpoints);
        let shared = Arc::new(Shared {
            state,
            ingest: Mutex::new(IngestLog { wal, last_lsn }),
            layers: RwLock::new(layers),
            store,
            checkpoint,
            watermark: DurableWatermark::new(watermark),
        });

        let signal = Arc::new(BackgroundSignal::default());
        let schedule = CheckpointSchedule {
            interval: config.checkpoint_interval(),
            retry_backoff: config.checkpoint_retry_backoff(),
            distance_enabled: config.checkpoint_distance > 0,
        };
        let flush_interval = match durability {
            DurabilityMode::Standard { interval_ms } => Some(Duration::from_millis(interval_ms)),
            DurabilityMode::Always => None,
        };
        let background =
            BackgroundWorkers::spawn(&shared, Arc::clone(&signal), schedule, flush_interval)?;

        shared.state.advance(ServerState::Serving);
        info!(
            target: "pagestore::server",
            path = %paths.root().display(),
            watermark = %watermark,
            last_record_lsn = %last_lsn,
            live_layers = recovery_stats.live_layers,
            replayed = recovery_stats.records_replayed,
            durability = durability.description(),
            "Page server serving"
        );

        Ok(PageServer {
            paths,
            config,
            shared,
            signal,
            background: Mutex::new(Some(background)),
            recovery_stats,
            _lock_file: lock_file,
        })
    }

    /// Halt ingestion and background work, then fsync the WAL
    ///
    /// Calling it again is a no-op.
    pub fn stop(&self) -> Result<()> {
        if !self.shared.state.advance(ServerState::Stopped) {
            return Ok(());
        }
        if let Some(mut background) = self.background.lock().take() {
            background.stop();
        }
        self.shared.ingest.lock().wal.sync()?;
        info!(target: "pagestore::server", path = %self.paths.root().display(), "Page server stopped");
        Ok(())
    }

    /// Accept one mutation
    ///
    /// The record must carry a position above every accepted one. Returns
    /// the position once the record is in the WAL and visible to reads; it
    /// is durable once `wait_for_durable` succeeds for it.
    pub fn ingest(&self, record: MutationRecord) -> Result<Lsn> {
        self.check_serving()?;
        let lsn = record.lsn;

        let mut log = self.shared.ingest.lock();
        if lsn <= log.last_lsn {
            warn!(
                target: "pagestore::ingest",
                last = %log.last_lsn,
                got = %lsn,
                "Rejected out-of-order mutation"
            );
            return Err(Error::OrderingViolation {
                last: log.last_lsn,
                got: lsn,
            });
        }

        let wal_record = WalRecord::from(record);
        if wal_record.framed_body_len() > MAX_RECORD_LEN {
            return Err(Error::RecordTooLarge {
                size: wal_record.framed_body_len(),
                limit: MAX_RECORD_LEN,
            });
        }
        if log.wal.is_poisoned() {
            return Err(Error::storage("WAL writer poisoned by a failed rollback"));
        }
        log.wal.append(&wal_record)?;
        let appends = {
            let mut layers = self.shared.layers.write();
            layers.insert(MutationRecord::from(wal_record))?;
            layers.active_appends()
        };
        log.last_lsn = lsn;
        drop(log);

        let distance = self.config.checkpoint_distance;
        if distance > 0 && appends >= distance {
            self.signal.request_checkpoint();
        }
        Ok(lsn)
    }

    /// Latest record for `key`
    pub fn get(&self, key: &Key) -> Result<Option<MutationRecord>> {
        self.check_serving()?;
        Ok(self.shared.layers.read().get(key))
    }

    /// Latest record per key within `range`, in key order
    pub fn range<R: RangeBounds<Key>>(&self, range: R) -> Result<Vec<MutationRecord>> {
        self.check_serving()?;
        Ok(self.shared.layers.read().scan(&key_bounds(range)))
    }

    /// Block until every mutation up to `lsn` is durable
    pub fn wait_for_durable(&self, lsn: Lsn, timeout: Duration) -> Result<()> {
        let watermark = self.shared.watermark.wait_for(lsn, timeout);
        if watermark >= lsn {
            Ok(())
        } else {
            Err(Error::DurabilityTimeout {
                target: lsn,
                watermark,
            })
        }
    }

    /// Checkpoint everything ingested so far
    ///
    /// Waits behind a checkpoint already in flight, then runs its own.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        self.check_serving()?;
        let shared = &self.shared;
        shared
            .checkpoint
            .run(&shared.target(), || shared.active_segment())
    }

    /// Checkpoint unless one is already running; `None` means it coalesced
    pub fn try_checkpoint(&self) -> Result<Option<CheckpointOutcome>> {
        self.check_serving()?;
        self.shared.try_checkpoint().transpose()
    }

    /// fsync the WAL now
    pub fn flush(&self) -> Result<()> {
        self.shared.ingest.lock().wal.sync()?;
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServerState {
        self.shared.state.get()
    }

    /// Highest position covered by published layers
    pub fn durable_watermark(&self) -> Lsn {
        self.shared.store.durable_watermark()
    }

    /// Highest accepted position
    pub fn last_record_lsn(&self) -> Lsn {
        self.shared.ingest.lock().last_lsn
    }

    /// Layers listed in the MANIFEST, in position order
    pub fn live_layers(&self) -> Vec<ManifestLayer> {
        self.shared.store.list_live_layers()
    }

    /// Every layer answering reads, oldest first
    pub fn layer_summaries(&self) -> Vec<LayerSummary> {
        self.shared.layers.read().summaries()
    }

    /// What the last start recovered
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery_stats
    }

    /// Checkpoints published and failed since start
    pub fn checkpoint_counts(&self) -> (u64, u64) {
        let engine = &self.shared.checkpoint;
        (engine.completed(), engine.failed())
    }

    /// Data directory
    pub fn data_dir(&self) -> &Path {
        self.paths.root()
    }

    /// Configuration in effect
    pub fn config(&self) -> &PageServerConfig {
        &self.config
    }

    fn check_serving(&self) -> Result<()> {
        match self.state() {
            ServerState::Serving => Ok(()),
            state => Err(Error::NotServing(format!("server is {}", state))),
        }
    }
}

impl Drop for PageServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(target: "pagestore::server", error = %e, "Error stopping page server");
        }
    }
}

fn lock_data_dir(paths: &DatabasePaths) -> Result<File> {
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(paths.lock_file())
        .map_err(|e| Error::storage(format!("failed to open lock file: {}", e)))?;
    lock_file.try_lock_exclusive().map_err(|_| {
        Error::storage(format!(
            "data directory '{}' is already in use by another server",
            paths.root().display()
        ))
    })?;
    Ok(lock_file)
}
