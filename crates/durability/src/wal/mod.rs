//! Segmented ingestion WAL
//!
//! - `config`: WAL configuration (WalConfig, WalConfigError)
//! - `mode`: when appends are fsynced (DurabilityMode)
//! - `writer`: appends records, rotates segments (WalWriter)
//! - `reader`: reads segments back for recovery and compaction (WalReader)

pub mod config;
pub mod mode;
pub mod reader;
pub mod writer;

pub use config::{WalConfig, WalConfigError};
pub use mode::DurabilityMode;
pub use reader::{
    list_segments, ReadStopReason, SegmentRead, TruncateInfo, WalReadResult, WalReader,
    WalReaderError,
};
pub use writer::{WalCounters, WalWriter};
