//! Page server engine for pagestore
//!
//! This crate orchestrates the lower layers:
//! - PageServer: start/stop lifecycle, ingestion, reads, durable waits
//! - CheckpointEngine: freeze, write, sync, publish, WAL compaction
//! - Background: checkpointer and WAL flush threads
//! - Configuration: `pagestore.toml` in the data directory
//!
//! # Example
//!
//! ```text
//! use pagestore_engine::PageServer;
//! use pagestore_core::MutationRecord;
//!
//! let server = PageServer::start("/data/pages")?;
//! server.ingest(MutationRecord::new("page-1", b"v1".to_vec(), 1))?;
//! server.checkpoint()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod background;
pub mod checkpoint;
pub mod server;

pub use checkpoint::{CheckpointEngine, CheckpointError, CheckpointOutcome, CheckpointTarget};
pub use server::{
    ConfigError, DurableWatermark, PageServer, PageServerConfig, ServerState, CONFIG_FILE_NAME,
};
