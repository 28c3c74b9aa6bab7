//! On-disk layer file format
//!
//! Layer files are named `layer-NNNNNN.lyr` and are written once, never
//! modified.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Header (48 bytes)                        │
//! │   magic "PSLY" (4) | version (4)         │
//! │   layer id (8) | start lsn (8)           │
//! │   end lsn (8) | entry count (8)          │
//! │   created at, micros since epoch (8)     │
//! ├──────────────────────────────────────────┤
//! │ Entry 1..N, ascending key order          │
//! │   key len (4) | key | lsn (8)            │
//! │   payload len (4) | payload              │
//! ├──────────────────────────────────────────┤
//! │ CRC32 of header + entries (4)            │
//! └──────────────────────────────────────────┘
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use pagestore_core::{Key, Lsn, LsnRange, MutationRecord};

/// Magic bytes identifying a layer file: "PSLY"
pub const LAYER_MAGIC: [u8; 4] = *b"PSLY";

/// Current layer file format version
pub const LAYER_FORMAT_VERSION: u32 = 1;

/// Size of the layer header in bytes
pub const LAYER_HEADER_SIZE: usize = 48;

/// Layer file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerFileHeader {
    /// Format version
    pub format_version: u32,
    /// Layer identifier, also encoded in the file name
    pub layer_id: u64,
    /// Positions covered by the layer
    pub range: LsnRange,
    /// Number of entries
    pub entry_count: u64,
    /// Creation time (microseconds since epoch)
    pub created_at: u64,
}

impl LayerFileHeader {
    /// Header for a layer written now
    pub fn new(layer_id: u64, range: LsnRange, entry_count: u64) -> Self {
        LayerFileHeader {
            format_version: LAYER_FORMAT_VERSION,
            layer_id,
            range,
            entry_count,
            created_at: now_micros(),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; LAYER_HEADER_SIZE] {
        let mut bytes = [0u8; LAYER_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&LAYER_MAGIC);
        bytes[4..8].copy_from_slice(&self.format_version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.layer_id.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.range.start.as_u64().to_le_bytes());
        bytes[24..32].copy_from_slice(&self.range.end.as_u64().to_le_bytes());
        bytes[32..40].copy_from_slice(&self.entry_count.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.created_at.to_le_bytes());
        bytes
    }

    /// Deserialize and validate a header
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LayerFileError> {
        if bytes.len() < LAYER_HEADER_SIZE {
            return Err(LayerFileError::TooShort);
        }
        if bytes[0..4] != LAYER_MAGIC {
            return Err(LayerFileError::InvalidMagic);
        }

        let mut cursor = Cursor::new(&bytes[4..LAYER_HEADER_SIZE]);
        let format_version = cursor.u32()?;
        if format_version != LAYER_FORMAT_VERSION {
            return Err(LayerFileError::UnsupportedVersion(format_version));
        }
        let layer_id = cursor.u64()?;
        let start = Lsn(cursor.u64()?);
        let end = Lsn(cursor.u64()?);
        let range = LsnRange::new(start, end).ok_or(LayerFileError::InvalidRange { start, end })?;
        let entry_count = cursor.u64()?;
        let created_at = cursor.u64()?;

        Ok(LayerFileHeader {
            format_version,
            layer_id,
            range,
            entry_count,
            created_at,
        })
    }
}

/// Layer file path: `layer-NNNNNN.lyr`
pub fn layer_path(dir: &Path, layer_id: u64) -> PathBuf {
    dir.join(format!("layer-{:06}.lyr", layer_id))
}

/// Parse a layer id out of a file name
pub fn parse_layer_name(name: &str) -> Option<u64> {
    name.strip_prefix("layer-")?
        .strip_suffix(".lyr")?
        .parse::<u64>()
        .ok()
}

/// Write a layer file at `path`
///
/// The file must not exist yet. Records must be in ascending key order
/// and inside `header.range`. Data is flushed to the OS but NOT synced;
/// the returned handle is what the caller syncs.
pub fn write_layer_file<'a>(
    path: &Path,
    header: &LayerFileHeader,
    records: impl IntoIterator<Item = &'a MutationRecord>,
) -> Result<File, LayerFileError> {
    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .read(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    let mut hasher = crc32fast::Hasher::new();

    let header_bytes = header.to_bytes();
    hasher.update(&header_bytes);
    writer.write_all(&header_bytes)?;

    let mut written = 0u64;
    let mut previous: Option<&Key> = None;
    for record in records {
        if previous.map_or(false, |p| p >= &record.key) {
            return Err(LayerFileError::KeysOutOfOrder);
        }
        if !header.range.contains(record.lsn) {
            return Err(LayerFileError::LsnOutOfRange {
                lsn: record.lsn,
                range: header.range,
            });
        }

        let key = record.key.as_bytes();
        let mut entry = Vec::with_capacity(16 + key.len() + record.payload.len());
        entry.extend_from_slice(&(key.len() as u32).to_le_bytes());
        entry.extend_from_slice(key);
        entry.extend_from_slice(&record.lsn.as_u64().to_le_bytes());
        entry.extend_from_slice(&(record.payload.len() as u32).to_le_bytes());
        entry.extend_from_slice(&record.payload);

        hasher.update(&entry);
        writer.write_all(&entry)?;
        written += 1;
        previous = Some(&record.key);
    }

    if written != header.entry_count {
        return Err(LayerFileError::EntryCountMismatch {
            header: header.entry_count,
            actual: written,
        });
    }

    writer.write_all(&hasher.finalize().to_le_bytes())?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| LayerFileError::Io(e.into_error()))
}

/// Read and validate a complete layer file
///
/// Returns the header and the entries in key order.
pub fn read_layer_file(path: &Path) -> Result<(LayerFileHeader, Vec<MutationRecord>), LayerFileError> {
    let bytes = std::fs::read(path)?;
    decode_layer(&bytes)
}

/// Decode layer file contents
pub fn decode_layer(bytes: &[u8]) -> Result<(LayerFileHeader, Vec<MutationRecord>), LayerFileError> {
    if bytes.len() < LAYER_HEADER_SIZE + 4 {
        return Err(LayerFileError::TooShort);
    }

    let (data, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored_crc = Cursor::new(crc_bytes).u32()?;
    let computed_crc = crc32fast::hash(data);
    if stored_crc != computed_crc {
        return Err(LayerFileError::ChecksumMismatch {
            expected: stored_crc,
            computed: computed_crc,
        });
    }

    let header = LayerFileHeader::from_bytes(data)?;
    let mut cursor = Cursor::new(&data[LAYER_HEADER_SIZE..]);
    let mut records = Vec::with_capacity(header.entry_count.min(1 << 20) as usize);

    for _ in 0..header.entry_count {
        let key_len = cursor.u32()? as usize;
        let key = Key::from(cursor.take(key_len)?);
        let lsn = Lsn(cursor.u64()?);
        let payload_len = cursor.u32()? as usize;
        let payload = cursor.take(payload_len)?.to_vec();

        if !header.range.contains(lsn) {
            return Err(LayerFileError::LsnOutOfRange {
                lsn,
                range: header.range,
            });
        }
        if records
            .last()
            .map_or(false, |prev: &MutationRecord| prev.key >= key)
        {
            return Err(LayerFileError::KeysOutOfOrder);
        }
        records.push(MutationRecord { key, payload, lsn });
    }

    if !cursor.is_empty() {
        return Err(LayerFileError::TrailingData);
    }

    Ok((header, records))
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Bounds-checked little-endian reader
struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], LayerFileError> {
        if self.bytes.len() < n {
            return Err(LayerFileError::TooShort);
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, LayerFileError> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(arr))
    }

    fn u64(&mut self) -> Result<u64, LayerFileError> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(arr))
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Layer file errors
#[derive(Debug, thiserror::Error)]
pub enum LayerFileError {
    /// File ends before its declared contents
    #[error("Layer file too short")]
    TooShort,

    /// Invalid magic bytes
    #[error("Invalid magic bytes")]
    InvalidMagic,

    /// Unknown format version
    #[error("Unsupported layer format version: {0}")]
    UnsupportedVersion(u32),

    /// Header range is inverted
    #[error("Invalid lsn range in header: {start} > {end}")]
    InvalidRange {
        /// Declared start
        start: Lsn,
        /// Declared end
        end: Lsn,
    },

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Stored CRC32
        expected: u32,
        /// Computed CRC32
        computed: u32,
    },

    /// An entry's position lies outside the header range
    #[error("Entry lsn {lsn} outside layer range {range}")]
    LsnOutOfRange {
        /// Entry position
        lsn: Lsn,
        /// Header range
        range: LsnRange,
    },

    /// Entries are not strictly ascending by key
    #[error("Entries not in ascending key order")]
    KeysOutOfOrder,

    /// Header entry count disagrees with the entries
    #[error("Entry count mismatch: header says {header}, found {actual}")]
    EntryCountMismatch {
        /// Count from header
        header: u64,
        /// Entries actually present
        actual: u64,
    },

    /// Bytes left after the last entry
    #[error("Trailing data after last entry")]
    TrailingData,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
