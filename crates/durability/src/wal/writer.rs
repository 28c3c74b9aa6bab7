//! WAL writer with durability mode support.
//!
//! The writer appends records to the active segment, rotates segments when
//! they fill up, and fsyncs according to the configured mode.

use super::reader::list_segments;
use super::DurabilityMode;
use crate::format::{WalRecord, WalSegment, MAX_RECORD_LEN};
use crate::wal::config::WalConfig;
use pagestore_core::Lsn;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, warn};

/// Cumulative WAL operation counters.
///
/// These counters accumulate over the lifetime of the WalWriter
/// and are never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalCounters {
    /// Total WAL record appends
    pub wal_appends: u64,
    /// Total sync/fsync calls
    pub sync_calls: u64,
    /// Total bytes written to WAL segments
    pub bytes_written: u64,
    /// Total segment rotations
    pub rotations: u64,
}

/// WAL writer with configurable durability modes.
///
/// # Segment Rotation
///
/// When a record would push the active segment past the configured size,
/// the writer closes (syncs) it and continues in a new segment. Closed
/// segments are immutable and may be removed by compaction once the
/// durable watermark covers them.
pub struct WalWriter {
    segment: WalSegment,
    durability: DurabilityMode,
    wal_dir: PathBuf,
    database_uuid: [u8; 16],
    config: WalConfig,

    /// Bytes written since last fsync
    bytes_since_sync: u64,
    /// Last fsync time
    last_sync_time: Instant,
    /// Whether there is data written but not yet fsynced
    has_unsynced_data: bool,
    /// Highest position appended through this writer
    last_lsn: Lsn,
    /// Set when a failed append could not be rolled back
    poisoned: bool,

    counters: WalCounters,

    #[cfg(test)]
    fail_next_sync: bool,
    #[cfg(test)]
    fail_next_rollback: bool,
}

impl WalWriter {
    /// Open the WAL for appending.
    ///
    /// Resumes the highest-numbered segment if it is readable, otherwise
    /// starts a new one after it. Any torn tail must already have been
    /// truncated by recovery.
    pub fn open(
        wal_dir: PathBuf,
        database_uuid: [u8; 16],
        durability: DurabilityMode,
        config: WalConfig,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(&wal_dir)?;

        let latest = list_segments(&wal_dir)?.last().copied();
        let segment = match latest {
            Some(num) => match WalSegment::open_append(&wal_dir, num) {
                Ok(seg) if seg.database_uuid() == database_uuid => seg,
                _ => WalSegment::create(&wal_dir, num + 1, database_uuid)?,
            },
            None => WalSegment::create(&wal_dir, 1, database_uuid)?,
        };

        debug!(
            target: "pagestore::wal",
            segment = segment.segment_number(),
            size = segment.size(),
            "Opened WAL for append"
        );

        Ok(WalWriter {
            segment,
            durability,
            wal_dir,
            database_uuid,
            config,
            bytes_since_sync: 0,
            last_sync_time: Instant::now(),
            has_unsynced_data: false,
            last_lsn: Lsn::INVALID,
            poisoned: false,
            counters: WalCounters::default(),
            #[cfg(test)]
            fail_next_sync: false,
            #[cfg(test)]
            fail_next_rollback: false,
        })
    }

    /// Append a record to the WAL.
    ///
    /// - `Always`: writes and fsyncs before returning
    /// - `Standard`: writes; fsync happens on the flush thread or once
    ///   `buffered_sync_bytes` have accumulated
    ///
    /// On error the segment is cut back to its length before the call, so
    /// a failed append leaves no bytes behind and the same position can be
    /// retried. If that cut fails too the writer is poisoned and every
    /// later append or sync fails.
    pub fn append(&mut self, record: &WalRecord) -> std::io::Result<()> {
        self.check_poisoned()?;
        if record.framed_body_len() > MAX_RECORD_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "WAL record of {} bytes exceeds limit of {}",
                    record.framed_body_len(),
                    MAX_RECORD_LEN
                ),
            ));
        }
        let bytes = record.to_bytes();

        if self.segment.size() + bytes.len() as u64 > self.config.segment_size
            && self.segment.size() > crate::format::SEGMENT_HEADER_SIZE as u64
        {
            self.rotate_segment()?;
        }

        let start = self.segment.size();
        if let Err(e) = self.write_record(&bytes) {
            self.roll_back(start, &e);
            return Err(e);
        }

        self.counters.wal_appends += 1;
        self.counters.bytes_written += bytes.len() as u64;
        if record.lsn > self.last_lsn {
            self.last_lsn = record.lsn;
        }
        Ok(())
    }

    fn write_record(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.segment.write(bytes)?;
        self.bytes_since_sync += bytes.len() as u64;
        self.has_unsynced_data = true;

        match self.durability {
            DurabilityMode::Always => self.sync(),
            DurabilityMode::Standard { .. } => {
                if self.bytes_since_sync >= self.config.buffered_sync_bytes {
                    self.sync()
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Cut the active segment back to `position` after a failed append
    fn roll_back(&mut self, position: u64, cause: &std::io::Error) {
        let written = self.segment.size().saturating_sub(position);
        self.bytes_since_sync = self.bytes_since_sync.saturating_sub(written);

        #[cfg(test)]
        let result = if self.fail_next_rollback {
            self.fail_next_rollback = false;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "injected rollback failure"))
        } else {
            self.segment.truncate(position)
        };
        #[cfg(not(test))]
        let result = self.segment.truncate(position);

        match result {
            Ok(()) => warn!(
                target: "pagestore::wal",
                segment = self.segment.segment_number(),
                position,
                error = %cause,
                "WAL append failed, segment rolled back"
            ),
            Err(e) => {
                error!(
                    target: "pagestore::wal",
                    segment = self.segment.segment_number(),
                    position,
                    error = %e,
                    cause = %cause,
                    "WAL rollback failed, writer poisoned"
                );
                self.poisoned = true;
            }
        }
    }

    fn check_poisoned(&self) -> std::io::Result<()> {
        if self.poisoned {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "WAL writer poisoned by a failed rollback",
            ));
        }
        Ok(())
    }

    /// Whether a failed rollback left the active segment in an unknown state
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Close the active segment and start the next one.
    fn rotate_segment(&mut self) -> std::io::Result<()> {
        self.segment.close()?;
        let next = self.segment.segment_number() + 1;
        self.segment = WalSegment::create(&self.wal_dir, next, self.database_uuid)?;
        crate::paths::sync_dir(&self.wal_dir)?;

        self.counters.rotations += 1;
        self.counters.sync_calls += 1;
        self.reset_sync_state();

        debug!(target: "pagestore::wal", segment = next, "Rotated WAL segment");
        Ok(())
    }

    fn reset_sync_state(&mut self) {
        self.bytes_since_sync = 0;
        self.last_sync_time = Instant::now();
        self.has_unsynced_data = false;
    }

    /// Force everything written so far to disk.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.check_poisoned()?;
        #[cfg(test)]
        if self.fail_next_sync {
            self.fail_next_sync = false;
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected sync failure"));
        }
        self.segment.sync()?;
        self.counters.sync_calls += 1;
        self.reset_sync_state();
        Ok(())
    }

    /// Sync if the Standard interval has elapsed and there is unsynced data.
    ///
    /// Called periodically by the flush thread. Returns `true` if a sync
    /// was performed.
    pub fn sync_if_overdue(&mut self) -> std::io::Result<bool> {
        if !self.has_unsynced_data {
            return Ok(false);
        }

        if let DurabilityMode::Standard { interval_ms } = self.durability {
            if self.last_sync_time.elapsed().as_millis() as u64 >= interval_ms {
                self.sync()?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether some appended bytes have not been synced yet
    pub fn has_unsynced_data(&self) -> bool {
        self.has_unsynced_data
    }

    /// Number of the active segment. Compaction never removes it.
    pub fn current_segment(&self) -> u64 {
        self.segment.segment_number()
    }

    /// Size of the active segment in bytes.
    pub fn current_segment_size(&self) -> u64 {
        self.segment.size()
    }

    /// Highest position appended through this writer
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Durability mode in effect
    pub fn durability(&self) -> DurabilityMode {
        self.durability
    }

    /// Snapshot of cumulative WAL counters.
    pub fn counters(&self) -> WalCounters {
        self.counters.clone()
    }

    /// WAL directory path.
    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// Sync and close the active segment.
    pub fn close(mut self) -> std::io::Result<()> {
        self.sync()?;
        self.segment.close()
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if self.has_unsynced_data && !self.poisoned {
            let _ = self.segment.sync();
        }
    }
}
