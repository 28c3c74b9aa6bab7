//! WAL segment compaction
//!
//! Removes WAL segments that are fully covered by the durable watermark.
//! Only data that is guaranteed to be recoverable from published layers is
//! removed.
//!
//! # Algorithm
//!
//! 1. Take the durable watermark W and the active segment number
//! 2. For each segment below the active one, in order:
//!    - Read all records and find the highest position
//!    - If highest position <= W, delete the segment
//!    - Otherwise stop: later segments only hold higher positions
//!
//! # Safety
//!
//! - Never removes the active segment
//! - A segment that cannot be read is kept

use std::path::{Path, PathBuf};
use std::time::Instant;

use pagestore_core::Lsn;
use tracing::{debug, info, warn};

use crate::format::WalSegment;
use crate::wal::{list_segments, WalReader};

/// Result of one compaction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactInfo {
    /// Watermark the pass compacted against
    pub watermark: Lsn,
    /// Segments deleted
    pub wal_segments_removed: usize,
    /// Bytes reclaimed
    pub reclaimed_bytes: u64,
    /// Wall time spent
    pub duration_ms: u64,
}

/// Removes WAL segments covered by the durable watermark
pub struct WalCompactor {
    wal_dir: PathBuf,
    reader: WalReader,
}

impl WalCompactor {
    /// Create a compactor over a WAL directory
    pub fn new(wal_dir: PathBuf) -> Self {
        WalCompactor {
            wal_dir,
            reader: WalReader::new(),
        }
    }

    /// WAL directory
    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// Delete closed segments whose highest position is <= `watermark`
    ///
    /// `active_segment` is the segment the writer currently appends to.
    pub fn compact(&self, watermark: Lsn, active_segment: u64) -> Result<CompactInfo, CompactionError> {
        let start = Instant::now();
        let mut info = CompactInfo {
            watermark,
            ..CompactInfo::default()
        };

        if !watermark.is_valid() {
            return Ok(info);
        }

        for segment_number in list_segments(&self.wal_dir)? {
            if segment_number >= active_segment {
                break;
            }

            let max_lsn = match self.reader.max_lsn_in_segment(&self.wal_dir, segment_number) {
                Ok(max) => max,
                Err(e) => {
                    warn!(
                        target: "pagestore::compaction",
                        segment = segment_number,
                        error = %e,
                        "Failed to check WAL segment coverage"
                    );
                    break;
                }
            };

            if max_lsn.map_or(false, |max| max > watermark) {
                debug!(
                    target: "pagestore::compaction",
                    segment = segment_number,
                    max_lsn = ?max_lsn,
                    watermark = %watermark,
                    "Segment not yet covered"
                );
                break;
            }

            let path = WalSegment::segment_path(&self.wal_dir, segment_number);
            let size = std::fs::metadata(&path)?.len();
            std::fs::remove_file(&path)?;
            info.wal_segments_removed += 1;
            info.reclaimed_bytes += size;
        }

        if info.wal_segments_removed > 0 {
            crate::paths::sync_dir(&self.wal_dir)?;
            info!(
                target: "pagestore::compaction",
                removed = info.wal_segments_removed,
                reclaimed_bytes = info.reclaimed_bytes,
                watermark = %watermark,
                "WAL compaction completed"
            );
        }

        info.duration_ms = start.elapsed().as_millis() as u64;
        Ok(info)
    }
}

/// Compaction errors
#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
