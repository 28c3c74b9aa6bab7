//! Segment sizing and sync batching for the ingestion WAL

/// Smallest accepted segment, header included
pub const MIN_SEGMENT_SIZE: u64 = 1024;

const DEFAULT_SEGMENT_SIZE: u64 = 16 << 20;
const DEFAULT_BUFFERED_SYNC_BYTES: u64 = 4 << 20;

/// WAL tuning
///
/// Compaction frees WAL space a whole segment at a time, and only once a
/// checkpoint covers every record in it. Smaller segments release space
/// sooner after each checkpoint at the cost of more files and rotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalConfig {
    /// Rotate before an append would grow the active segment past this.
    /// A single record larger than this still goes into an empty segment.
    pub segment_size: u64,

    /// In `Standard` mode, fsync on the append path once this many bytes
    /// are unsynced, without waiting for the flush thread.
    pub buffered_sync_bytes: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            segment_size: DEFAULT_SEGMENT_SIZE,
            buffered_sync_bytes: DEFAULT_BUFFERED_SYNC_BYTES,
        }
    }
}

impl WalConfig {
    /// Defaults: 16 MiB segments, 4 MiB sync batches
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the rotation threshold
    pub fn with_segment_size(self, segment_size: u64) -> Self {
        WalConfig {
            segment_size,
            ..self
        }
    }

    /// Override the Standard-mode sync batch
    pub fn with_buffered_sync_bytes(self, buffered_sync_bytes: u64) -> Self {
        WalConfig {
            buffered_sync_bytes,
            ..self
        }
    }

    /// Reject sizes the writer cannot honour
    pub fn validate(&self) -> Result<(), WalConfigError> {
        if self.segment_size < MIN_SEGMENT_SIZE {
            Err(WalConfigError::SegmentSizeTooSmall)
        } else if self.buffered_sync_bytes > self.segment_size {
            Err(WalConfigError::BufferedSyncExceedsSegment)
        } else {
            Ok(())
        }
    }

    /// 64 KiB segments so that tests rotate and compact after a few hundred
    /// small records
    pub fn for_testing() -> Self {
        WalConfig {
            segment_size: 64 << 10,
            buffered_sync_bytes: 16 << 10,
        }
    }
}

/// Rejected WAL tuning
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalConfigError {
    /// Below `MIN_SEGMENT_SIZE`
    #[error("segment size must be at least {} bytes", MIN_SEGMENT_SIZE)]
    SegmentSizeTooSmall,

    /// A sync batch larger than a segment would never fill before rotation
    #[error("buffered sync bytes must not exceed the segment size")]
    BufferedSyncExceedsSegment,
}
