//! pagestore - page-oriented storage server
//!
//! Accepts an ordered stream of page mutations, buffers them in memory,
//! checkpoints them into immutable on-disk layers and recovers exactly after
//! an unclean shutdown, including one in the middle of a checkpoint.
//!
//! # Quick Start
//!
//! ```ignore
//! use pagestore::{Key, MutationRecord, PageServer};
//! use std::time::Duration;
//!
//! let server = PageServer::start("/data/pages")?;
//! let lsn = server.ingest(MutationRecord::new("page-1", b"v1".to_vec(), 1))?;
//! server.checkpoint()?;
//! server.wait_for_durable(lsn, Duration::from_secs(1))?;
//! assert!(server.get(&Key::from("page-1"))?.is_some());
//! ```
//!
//! # Architecture
//!
//! - `pagestore-core`: positions, keys, records, errors
//! - `pagestore-storage`: in-memory layers and the merged read path
//! - `pagestore-durability`: WAL, layer files, MANIFEST, recovery, failpoints
//! - `pagestore-engine`: the page server and its checkpoint engine

pub use pagestore_core::{
    bounds_are_empty, key_bounds, Error, Key, KeyBounds, LayerRead, Lsn, LsnRange,
    MutationRecord, Result,
};
pub use pagestore_durability::{
    DurabilityMode, FailAction, FailpointParseError, FailpointRegistry, ManifestLayer,
    RecoveryStats, CHECKPOINT_AFTER_SYNC, CHECKPOINT_BEFORE_SYNC,
};
pub use pagestore_engine::{
    CheckpointOutcome, ConfigError, PageServer, PageServerConfig, ServerState, CONFIG_FILE_NAME,
};
pub use pagestore_storage::LayerSummary;
