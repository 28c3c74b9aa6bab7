//! Error types for pagestore
//!
//! This module defines the error type returned at the public boundary.
//! Lower crates keep their own `thiserror` enums and convert into this one.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use crate::types::Lsn;
use std::io;
use thiserror::Error;

/// Result type alias for pagestore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for pagestore
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Data corruption detected in a layer file or WAL segment
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The manifest could not be read back.
    ///
    /// Fatal: the manifest is the one piece of state that cannot be rebuilt.
    #[error("Manifest corrupted: {0}")]
    ManifestCorrupted(String),

    /// Mutation arrived with a position not after the last accepted one
    #[error("Out-of-order mutation: lsn {got} does not follow last accepted lsn {last}")]
    OrderingViolation {
        /// Last accepted position
        last: Lsn,
        /// Rejected position
        got: Lsn,
    },

    /// Mutation too large to be framed in a single WAL record
    #[error("Mutation of {size} bytes exceeds the WAL record limit of {limit} bytes")]
    RecordTooLarge {
        /// Framed size of the rejected record
        size: usize,
        /// Largest accepted framed size
        limit: usize,
    },

    /// Checkpoint did not publish; the data is still held in memory
    #[error("Checkpoint failed (retryable): {0}")]
    CheckpointFailed(String),

    /// Operation requires a serving server
    #[error("Server not serving: {0}")]
    NotServing(String),

    /// The durable watermark did not reach the requested position in time
    #[error("Timed out waiting for lsn {target} to become durable (watermark {watermark})")]
    DurabilityTimeout {
        /// Requested position
        target: Lsn,
        /// Watermark when the wait gave up
        watermark: Lsn,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Storage layer error
    #[error("Storage error: {0}")]
    StorageError(String),
}

impl Error {
    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::StorageError(msg.into())
    }

    /// Whether the caller may simply retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CheckpointFailed(_) | Error::DurabilityTimeout { .. } | Error::IoError(_)
        )
    }

    /// Whether the error needs operator intervention
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ManifestCorrupted(_) | Error::Corruption(_))
    }
}
