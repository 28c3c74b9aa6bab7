//! WAL reader for recovery, replay and compaction.

use crate::format::{WalRecord, WalRecordError, WalSegment};
use pagestore_core::Lsn;
use std::path::Path;
use tracing::warn;

/// List all segment numbers in a WAL directory, ascending.
pub fn list_segments(wal_dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(wal_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(num) = name.to_str().and_then(WalSegment::parse_segment_name) {
            segments.push(num);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Records read from one segment and where the valid prefix ends
#[derive(Debug)]
pub struct SegmentRead {
    /// Valid records in order
    pub records: Vec<WalRecord>,
    /// File offset just past the last valid record
    pub valid_end: u64,
    /// File size when read
    pub size: u64,
    /// Why reading stopped
    pub stop_reason: ReadStopReason,
}

/// WAL reader.
///
/// Stateless; reads individual segments or scans all segments in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct WalReader;

impl WalReader {
    /// Create a new WAL reader.
    pub fn new() -> Self {
        WalReader
    }

    /// Read all records from a single segment.
    ///
    /// Stops at the first incomplete, checksum-failing or unparseable
    /// record. Nothing after it is returned: the records read are always a
    /// prefix of what was appended.
    pub fn read_segment(
        &self,
        wal_dir: &Path,
        segment_number: u64,
    ) -> Result<SegmentRead, WalReaderError> {
        let mut segment = WalSegment::open_read(wal_dir, segment_number)
            .map_err(|e| WalReaderError::Segment {
                segment: segment_number,
                detail: e.to_string(),
            })?;
        let size = segment.size();
        let header_size = crate::format::SEGMENT_HEADER_SIZE as u64;
        let buffer = segment
            .read_body()
            .map_err(|e| WalReaderError::IoError(e.to_string()))?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        let mut valid_end = header_size;
        let mut stop_reason = ReadStopReason::EndOfData;

        while offset < buffer.len() {
            let remaining = &buffer[offset..];
            match WalRecord::from_bytes(remaining) {
                Ok((record, consumed)) => {
                    records.push(record);
                    offset += consumed;
                    valid_end = header_size + offset as u64;
                }
                Err(WalRecordError::InsufficientData) => {
                    // Torn write at the tail, expected after a crash
                    stop_reason = ReadStopReason::PartialRecord;
                    break;
                }
                Err(WalRecordError::ChecksumMismatch { .. }) => {
                    warn!(
                        target: "pagestore::wal",
                        segment = segment_number,
                        offset,
                        "WAL record checksum mismatch, log ends here"
                    );
                    stop_reason = ReadStopReason::ChecksumMismatch { offset };
                    break;
                }
                Err(e) => {
                    stop_reason = ReadStopReason::ParseError {
                        offset,
                        detail: e.to_string(),
                    };
                    break;
                }
            }
        }

        Ok(SegmentRead {
            records,
            valid_end,
            size,
            stop_reason,
        })
    }

    /// Read all records from all segments, in segment order.
    ///
    /// Only the last segment may end in unreadable data; `truncate_info`
    /// describes where its valid prefix ends. Unreadable data inside an
    /// earlier segment would drop records that later segments build on, so
    /// it fails the read.
    pub fn read_all(&self, wal_dir: &Path) -> Result<WalReadResult, WalReaderError> {
        let segments =
            list_segments(wal_dir).map_err(|e| WalReaderError::IoError(e.to_string()))?;

        let mut result = WalReadResult {
            records: Vec::new(),
            truncate_info: None,
            stop_reason: ReadStopReason::EndOfData,
            segments: segments.clone(),
        };

        for (idx, &segment_number) in segments.iter().enumerate() {
            let read = self.read_segment(wal_dir, segment_number)?;
            let is_last = idx + 1 == segments.len();

            if read.valid_end < read.size {
                if is_last {
                    result.truncate_info = Some(TruncateInfo {
                        segment_number,
                        valid_end: read.valid_end,
                        original_size: read.size,
                    });
                } else {
                    return Err(WalReaderError::DamagedSegment {
                        segment: segment_number,
                        valid_end: read.valid_end,
                        reason: read.stop_reason,
                    });
                }
            }

            result.records.extend(read.records);
            result.stop_reason = read.stop_reason;
        }

        Ok(result)
    }

    /// Highest position in a segment, `None` if it holds no records.
    pub fn max_lsn_in_segment(
        &self,
        wal_dir: &Path,
        segment_number: u64,
    ) -> Result<Option<Lsn>, WalReaderError> {
        let read = self.read_segment(wal_dir, segment_number)?;
        Ok(read.records.iter().map(|r| r.lsn).max())
    }
}

/// Reason why record reading stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStopReason {
    /// Read everything
    EndOfData,
    /// Partial record at end of segment (expected after crash)
    PartialRecord,
    /// Record failed its checksum
    ChecksumMismatch {
        /// Offset within the segment body
        offset: usize,
    },
    /// Checksum valid (or length absurd) but the record does not parse
    ParseError {
        /// Offset within the segment body
        offset: usize,
        /// Human-readable error description
        detail: String,
    },
}

/// Result of reading all WAL segments.
#[derive(Debug)]
pub struct WalReadResult {
    /// All valid records in order
    pub records: Vec<WalRecord>,
    /// Truncation needed on the last segment, if any
    pub truncate_info: Option<TruncateInfo>,
    /// Why reading of the last segment stopped
    pub stop_reason: ReadStopReason,
    /// Segment numbers that were read
    pub segments: Vec<u64>,
}

/// A segment with a torn tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncateInfo {
    /// Segment number
    pub segment_number: u64,
    /// Offset where valid data ends
    pub valid_end: u64,
    /// Original file size
    pub original_size: u64,
}

impl TruncateInfo {
    /// Number of bytes that need to be truncated.
    pub fn bytes_to_truncate(&self) -> u64 {
        self.original_size - self.valid_end
    }

    /// Cut the segment back to its valid prefix
    pub fn apply(&self, wal_dir: &Path) -> std::io::Result<()> {
        let mut segment = WalSegment::open_append(wal_dir, self.segment_number)?;
        segment.truncate(self.valid_end)
    }
}

/// WAL reader errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalReaderError {
    /// I/O error
    #[error("I/O error: {0}")]
    IoError(String),

    /// Segment exists but its header is unreadable
    #[error("Unreadable WAL segment {segment}: {detail}")]
    Segment {
        /// Segment number
        segment: u64,
        /// Underlying failure
        detail: String,
    },

    /// A segment followed by later segments ends in unreadable data
    #[error("WAL segment {segment} damaged at offset {valid_end} with later segments: {reason:?}")]
    DamagedSegment {
        /// Segment number
        segment: u64,
        /// Offset where valid data ends
        valid_end: u64,
        /// What was found there
        reason: ReadStopReason,
    },
}
