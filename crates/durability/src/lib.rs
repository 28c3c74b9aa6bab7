//! Durability layer for pagestore
//!
//! This crate handles everything that touches disk:
//!
//! - WAL: Segmented ingestion log, one record per accepted mutation
//! - Durability modes: Always, Standard (default)
//! - Layer files: immutable, key-ordered serializations of frozen layers
//! - MANIFEST: live layers + durable watermark, replaced atomically
//! - Layer Store: append / sync / publish of on-disk layers
//! - Recovery: MANIFEST + layers + WAL tail, orphan cleanup
//! - WAL segment compaction below the durable watermark
//! - Failpoints: named fault-injection hooks on the checkpoint path

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compaction;
pub mod failpoint;
pub mod format;
pub mod layer_store;
pub mod paths;
pub mod recovery;
pub mod wal;

pub use compaction::{CompactInfo, CompactionError, WalCompactor};
pub use failpoint::{
    FailAction, FailpointParseError, FailpointRegistry, CHECKPOINT_AFTER_SYNC,
    CHECKPOINT_BEFORE_SYNC,
};
pub use format::{ManifestError, ManifestLayer, MAX_RECORD_LEN};
pub use layer_store::{DiskLayer, LayerHandle, LayerStore, LayerStoreError};
pub use paths::DatabasePaths;
pub use recovery::{RecoveryCoordinator, RecoveryError, RecoveryPlan, RecoveryResult, RecoveryStats};
pub use wal::{DurabilityMode, WalConfig, WalConfigError, WalReader, WalWriter};
