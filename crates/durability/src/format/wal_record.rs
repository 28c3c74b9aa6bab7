//! WAL segment file and record format.
//!
//! WAL segments are named `wal-NNNNNN.seg` where `NNNNNN` is a zero-padded segment number.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (32 bytes)          │
//! ├────────────────────────────────────┤
//! │ Record 1                           │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬──────────────────┬─────────────────────────┬──────────┐
//! │ Length (4 bytes)│ Format Ver (1)   │ Body (variable)         │ CRC32 (4)│
//! └─────────────────┴──────────────────┴─────────────────────────┴──────────┘
//!
//! Body:
//! ┌──────────┬──────────────┬──────────────┬──────────────────────┐
//! │ Lsn (8)  │ Key Len (4)  │ Key          │ Payload (rest)       │
//! └──────────┴──────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! The length field covers version, body and CRC. The CRC covers version
//! and body.

use crc32fast::Hasher;
use pagestore_core::{Key, Lsn, MutationRecord};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes identifying a WAL segment file: "PSWL"
pub const SEGMENT_MAGIC: [u8; 4] = *b"PSWL";

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of segment header in bytes
pub const SEGMENT_HEADER_SIZE: usize = 32;

/// Current WAL record format version
pub const WAL_RECORD_FORMAT_VERSION: u8 = 1;

/// Upper bound on a single record's length field
pub const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

/// Version byte + lsn + key length
const MIN_BODY_LEN: usize = 1 + 8 + 4;

/// WAL segment header (32 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes: "PSWL"
    pub magic: [u8; 4],
    /// Format version
    pub format_version: u32,
    /// Segment number (monotonically increasing)
    pub segment_number: u64,
    /// Database UUID, identical across all segments of one data directory
    pub database_uuid: [u8; 16],
}

impl SegmentHeader {
    /// Create a new segment header.
    pub fn new(segment_number: u64, database_uuid: [u8; 16]) -> Self {
        SegmentHeader {
            magic: SEGMENT_MAGIC,
            format_version: SEGMENT_FORMAT_VERSION,
            segment_number,
            database_uuid,
        }
    }

    /// Serialize header to bytes.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.segment_number.to_le_bytes());
        bytes[16..32].copy_from_slice(&self.database_uuid);
        bytes
    }

    /// Deserialize header from bytes.
    pub fn from_bytes(bytes: &[u8; SEGMENT_HEADER_SIZE]) -> Option<Self> {
        Some(SegmentHeader {
            magic: bytes[0..4].try_into().ok()?,
            format_version: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            segment_number: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            database_uuid: bytes[16..32].try_into().ok()?,
        })
    }

    /// Whether magic and version are recognised
    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC && self.format_version == SEGMENT_FORMAT_VERSION
    }
}

/// WAL segment file handle.
///
/// Only the active segment is writable; closed segments are immutable.
pub struct WalSegment {
    file: File,
    segment_number: u64,
    write_position: u64,
    path: PathBuf,
    closed: bool,
    database_uuid: [u8; 16],
}

impl WalSegment {
    /// Create a new segment file and write its header.
    pub fn create(
        dir: &Path,
        segment_number: u64,
        database_uuid: [u8; 16],
    ) -> std::io::Result<Self> {
        let path = Self::segment_path(dir, segment_number);

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .read(true)
            .open(&path)?;

        let header = SegmentHeader::new(segment_number, database_uuid);
        file.write_all(&header.to_bytes())?;

        Ok(WalSegment {
            file,
            segment_number,
            write_position: SEGMENT_HEADER_SIZE as u64,
            path,
            closed: false,
            database_uuid,
        })
    }

    /// Open an existing segment for reading.
    pub fn open_read(dir: &Path, segment_number: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(Self::segment_path(dir, segment_number))?;
        Self::open_with(file, dir, segment_number, true)
    }

    /// Open an existing segment for appending (resume after restart).
    pub fn open_append(dir: &Path, segment_number: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::segment_path(dir, segment_number))?;
        Self::open_with(file, dir, segment_number, false)
    }

    fn open_with(
        mut file: File,
        dir: &Path,
        segment_number: u64,
        closed: bool,
    ) -> std::io::Result<Self> {
        let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;

        let header = SegmentHeader::from_bytes(&header_bytes)
            .filter(SegmentHeader::is_valid)
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "Invalid segment header")
            })?;

        if header.segment_number != segment_number {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "Segment number mismatch: expected {}, got {}",
                    segment_number, header.segment_number
                ),
            ));
        }

        let write_position = file.seek(SeekFrom::End(0))?;

        Ok(WalSegment {
            file,
            segment_number,
            write_position,
            path: Self::segment_path(dir, segment_number),
            closed,
            database_uuid: header.database_uuid,
        })
    }

    /// Segment file path: `wal-NNNNNN.seg`.
    pub fn segment_path(dir: &Path, segment_number: u64) -> PathBuf {
        dir.join(format!("wal-{:06}.seg", segment_number))
    }

    /// Parse a segment number out of a file name
    pub fn parse_segment_name(name: &str) -> Option<u64> {
        name.strip_prefix("wal-")?
            .strip_suffix(".seg")?
            .parse::<u64>()
            .ok()
    }

    /// Segment number.
    pub fn segment_number(&self) -> u64 {
        self.segment_number
    }

    /// Current size in bytes, header included.
    pub fn size(&self) -> u64 {
        self.write_position
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Database UUID from the header.
    pub fn database_uuid(&self) -> [u8; 16] {
        self.database_uuid
    }

    /// Append bytes. Fails on a closed segment.
    pub fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "Cannot write to closed segment",
            ));
        }

        self.file.write_all(data)?;
        self.write_position += data.len() as u64;
        Ok(())
    }

    /// Sync segment data to disk.
    pub fn sync(&mut self) -> std::io::Result<()> {
        self.file.sync_all()
    }

    /// Sync and mark the segment immutable.
    pub fn close(&mut self) -> std::io::Result<()> {
        if !self.closed {
            self.file.sync_all()?;
            self.closed = true;
        }
        Ok(())
    }

    /// Whether the segment is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read everything after the header.
    pub fn read_body(&mut self) -> std::io::Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE as u64))?;
        let mut buffer = Vec::new();
        self.file.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Cut the segment at `position`, dropping a torn tail.
    pub fn truncate(&mut self, position: u64) -> std::io::Result<()> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "Cannot truncate closed segment",
            ));
        }

        self.file.set_len(position)?;
        self.file.sync_all()?;
        self.write_position = position;
        self.file.seek(SeekFrom::Start(position))?;
        Ok(())
    }
}

/// One ingested mutation as framed in the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Position assigned by the frontend
    pub lsn: Lsn,
    /// Target page key
    pub key: Key,
    /// New page contents
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Create a new WAL record.
    pub fn new(lsn: Lsn, key: Key, payload: Vec<u8>) -> Self {
        WalRecord { lsn, key, payload }
    }

    /// Value of the length prefix this record is framed with
    ///
    /// Must not exceed `MAX_RECORD_LEN` for the record to be readable.
    pub fn framed_body_len(&self) -> usize {
        MIN_BODY_LEN + self.key.len() + self.payload.len() + 4
    }

    /// Serialize to `length + version + body + crc32`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let key = self.key.as_bytes();
        let mut body = Vec::with_capacity(MIN_BODY_LEN + key.len() + self.payload.len());
        body.push(WAL_RECORD_FORMAT_VERSION);
        body.extend_from_slice(&self.lsn.as_u64().to_le_bytes());
        body.extend_from_slice(&(key.len() as u32).to_le_bytes());
        body.extend_from_slice(key);
        body.extend_from_slice(&self.payload);

        let crc = compute_crc(&body);

        let total_len = body.len() + 4;
        let mut record = Vec::with_capacity(4 + total_len);
        record.extend_from_slice(&(total_len as u32).to_le_bytes());
        record.extend_from_slice(&body);
        record.extend_from_slice(&crc.to_le_bytes());
        record
    }

    /// Deserialize one record from the front of `bytes`.
    ///
    /// Returns (record, bytes_consumed) on success.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), WalRecordError> {
        let length = read_length(bytes)?;
        if length < MIN_BODY_LEN + 4 || length > MAX_RECORD_LEN {
            return Err(WalRecordError::InvalidFormat);
        }
        if bytes.len() < 4 + length {
            return Err(WalRecordError::InsufficientData);
        }

        let framed = &bytes[4..4 + length];
        let (body, crc_bytes) = framed.split_at(length - 4);
        let stored_crc = le_u32(crc_bytes)?;
        let computed_crc = compute_crc(body);
        if stored_crc != computed_crc {
            return Err(WalRecordError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        if body[0] != WAL_RECORD_FORMAT_VERSION {
            return Err(WalRecordError::UnsupportedVersion(body[0]));
        }

        let lsn = Lsn(le_u64(&body[1..9])?);
        let key_len = le_u32(&body[9..13])? as usize;
        let rest = &body[13..];
        if key_len > rest.len() {
            return Err(WalRecordError::InvalidFormat);
        }
        let (key, payload) = rest.split_at(key_len);

        let record = WalRecord {
            lsn,
            key: Key::from(key),
            payload: payload.to_vec(),
        };
        Ok((record, 4 + length))
    }
}

impl From<MutationRecord> for WalRecord {
    fn from(record: MutationRecord) -> Self {
        WalRecord::new(record.lsn, record.key, record.payload)
    }
}

impl From<WalRecord> for MutationRecord {
    fn from(record: WalRecord) -> Self {
        MutationRecord {
            key: record.key,
            payload: record.payload,
            lsn: record.lsn,
        }
    }
}

fn read_length(bytes: &[u8]) -> Result<usize, WalRecordError> {
    if bytes.len() < 4 {
        return Err(WalRecordError::InsufficientData);
    }
    Ok(le_u32(&bytes[0..4])? as usize)
}

fn le_u32(bytes: &[u8]) -> Result<u32, WalRecordError> {
    let arr: [u8; 4] = bytes.try_into().map_err(|_| WalRecordError::InvalidFormat)?;
    Ok(u32::from_le_bytes(arr))
}

fn le_u64(bytes: &[u8]) -> Result<u64, WalRecordError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| WalRecordError::InvalidFormat)?;
    Ok(u64::from_le_bytes(arr))
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// WAL record parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalRecordError {
    /// Not enough data to parse record
    #[error("Insufficient data to parse record")]
    InsufficientData,

    /// Record format is invalid
    #[error("Invalid record format")]
    InvalidFormat,

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected checksum from record
        expected: u32,
        /// Computed checksum
        computed: u32,
    },

    /// Unsupported format version
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u8),
}
