//! MANIFEST file format
//!
//! The MANIFEST is the single source of truth for which on-disk layers are
//! live and how far the durable watermark has advanced. It is never patched
//! in place: every update writes a complete new image.
//!
//! # Format
//!
//! ```text
//! +--------------------+
//! | Magic: "PSMF"      | 4 bytes
//! | Format Version     | 4 bytes (u32 LE)
//! | Database UUID      | 16 bytes
//! | Durable Watermark  | 8 bytes (u64 LE, 0 = nothing durable)
//! | Next Layer Id      | 8 bytes (u64 LE)
//! | Layer Count        | 4 bytes (u32 LE)
//! | Layers             | 24 bytes each: id, start lsn, end lsn
//! | CRC32              | 4 bytes
//! +--------------------+
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use pagestore_core::{Lsn, LsnRange};

use crate::paths::sync_dir;

/// MANIFEST magic bytes: "PSMF"
pub const MANIFEST_MAGIC: [u8; 4] = *b"PSMF";

/// Current MANIFEST format version
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

const FIXED_LEN: usize = 4 + 4 + 16 + 8 + 8 + 4;
const ENTRY_LEN: usize = 24;

/// One live layer as recorded in the MANIFEST
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLayer {
    /// Layer identifier (file `layer-<id>.lyr`)
    pub layer_id: u64,
    /// Positions covered
    pub range: LsnRange,
}

/// MANIFEST contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Format version
    pub format_version: u32,
    /// Unique database identifier (generated on creation)
    pub database_uuid: [u8; 16],
    /// Every position at or below this is durable in the live layers
    pub durable_watermark: Lsn,
    /// Next layer id to allocate
    pub next_layer_id: u64,
    /// Live layers ordered by position range
    pub layers: Vec<ManifestLayer>,
}

impl Manifest {
    /// MANIFEST for a fresh data directory
    pub fn new(database_uuid: [u8; 16]) -> Self {
        Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            database_uuid,
            durable_watermark: Lsn::INVALID,
            next_layer_id: 1,
            layers: Vec::new(),
        }
    }

    /// Whether `layer_id` is a live layer
    pub fn references(&self, layer_id: u64) -> bool {
        self.layers.iter().any(|l| l.layer_id == layer_id)
    }

    /// Serialize MANIFEST to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FIXED_LEN + self.layers.len() * ENTRY_LEN + 4);

        bytes.extend_from_slice(&MANIFEST_MAGIC);
        bytes.extend_from_slice(&self.format_version.to_le_bytes());
        bytes.extend_from_slice(&self.database_uuid);
        bytes.extend_from_slice(&self.durable_watermark.as_u64().to_le_bytes());
        bytes.extend_from_slice(&self.next_layer_id.to_le_bytes());
        bytes.extend_from_slice(&(self.layers.len() as u32).to_le_bytes());
        for layer in &self.layers {
            bytes.extend_from_slice(&layer.layer_id.to_le_bytes());
            bytes.extend_from_slice(&layer.range.start.as_u64().to_le_bytes());
            bytes.extend_from_slice(&layer.range.end.as_u64().to_le_bytes());
        }

        // CRC32 of all preceding bytes
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    /// Deserialize MANIFEST from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        if bytes.len() < FIXED_LEN + 4 {
            return Err(ManifestError::TooShort);
        }
        if bytes[0..4] != MANIFEST_MAGIC {
            return Err(ManifestError::InvalidMagic);
        }

        let (data, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored_crc = u32::from_le_bytes(array(crc_bytes)?);
        let computed_crc = crc32fast::hash(data);
        if stored_crc != computed_crc {
            return Err(ManifestError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        let format_version = u32::from_le_bytes(array(&data[4..8])?);
        if format_version != MANIFEST_FORMAT_VERSION {
            return Err(ManifestError::UnsupportedVersion(format_version));
        }
        let database_uuid: [u8; 16] = array(&data[8..24])?;
        let durable_watermark = Lsn(u64::from_le_bytes(array(&data[24..32])?));
        let next_layer_id = u64::from_le_bytes(array(&data[32..40])?);
        let layer_count = u32::from_le_bytes(array(&data[40..44])?) as usize;

        if data.len() != FIXED_LEN + layer_count * ENTRY_LEN {
            return Err(ManifestError::TooShort);
        }

        let mut layers = Vec::with_capacity(layer_count);
        for chunk in data[FIXED_LEN..].chunks_exact(ENTRY_LEN) {
            let layer_id = u64::from_le_bytes(array(&chunk[0..8])?);
            let start = Lsn(u64::from_le_bytes(array(&chunk[8..16])?));
            let end = Lsn(u64::from_le_bytes(array(&chunk[16..24])?));
            let range = LsnRange::new(start, end).ok_or_else(|| {
                ManifestError::Inconsistent(format!("layer {} has range {} > {}", layer_id, start, end))
            })?;
            layers.push(ManifestLayer { layer_id, range });
        }

        let manifest = Manifest {
            format_version,
            database_uuid,
            durable_watermark,
            next_layer_id,
            layers,
        };
        manifest.check_consistency()?;
        Ok(manifest)
    }

    /// Structural invariants every persisted MANIFEST satisfies
    ///
    /// Layer ranges are ordered and disjoint, the last layer ends exactly at
    /// the watermark, and every layer id is below `next_layer_id`.
    pub fn check_consistency(&self) -> Result<(), ManifestError> {
        let mut previous: Option<&ManifestLayer> = None;
        for layer in &self.layers {
            if layer.layer_id >= self.next_layer_id {
                return Err(ManifestError::Inconsistent(format!(
                    "layer id {} not below next id {}",
                    layer.layer_id, self.next_layer_id
                )));
            }
            if let Some(prev) = previous {
                if prev.range.end >= layer.range.start {
                    return Err(ManifestError::Inconsistent(format!(
                        "layer {} range {} overlaps or precedes layer {} range {}",
                        layer.layer_id, layer.range, prev.layer_id, prev.range
                    )));
                }
            }
            previous = Some(layer);
        }

        let last_end = self.layers.last().map(|l| l.range.end).unwrap_or(Lsn::INVALID);
        if last_end != self.durable_watermark {
            return Err(ManifestError::Inconsistent(format!(
                "watermark {} does not match last layer end {}",
                self.durable_watermark, last_end
            )));
        }
        Ok(())
    }
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], ManifestError> {
    bytes.try_into().map_err(|_| ManifestError::TooShort)
}

/// MANIFEST persistence manager
///
/// Handles atomic MANIFEST persistence using the write-fsync-rename pattern.
pub struct ManifestManager {
    path: PathBuf,
    manifest: Manifest,
}

impl ManifestManager {
    /// Create and persist a new MANIFEST
    pub fn create(path: PathBuf, database_uuid: [u8; 16]) -> Result<Self, ManifestError> {
        let manager = ManifestManager {
            path,
            manifest: Manifest::new(database_uuid),
        };
        manager.persist_image(&manager.manifest)?;
        Ok(manager)
    }

    /// Load an existing MANIFEST
    pub fn load(path: PathBuf) -> Result<Self, ManifestError> {
        let bytes = std::fs::read(&path)?;
        let manifest = Manifest::from_bytes(&bytes)?;
        Ok(ManifestManager { path, manifest })
    }

    /// Whether a MANIFEST file exists at `path` (test helper)
    #[cfg(test)]
    fn exists(path: &Path) -> bool {
        path.exists()
    }

    /// Path of the temp image written before the rename
    pub fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }

    /// Get the MANIFEST path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the current manifest
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Add a live layer and advance the watermark to its end
    ///
    /// The in-memory image is replaced only after the new image is durable,
    /// so a failed publish leaves both the file and `manifest()` unchanged.
    pub fn publish_layer(
        &mut self,
        layer: ManifestLayer,
        next_layer_id: u64,
    ) -> Result<(), ManifestError> {
        if layer.range.end < self.manifest.durable_watermark {
            return Err(ManifestError::WatermarkRegression {
                current: self.manifest.durable_watermark,
                proposed: layer.range.end,
            });
        }

        let mut next = self.manifest.clone();
        next.layers.push(layer);
        next.durable_watermark = layer.range.end;
        next.next_layer_id = next.next_layer_id.max(next_layer_id);
        next.check_consistency()?;

        self.persist_image(&next)?;
        self.manifest = next;
        Ok(())
    }

    /// Write-fsync-rename-fsync
    fn persist_image(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        let temp_path = self.temp_path();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&manifest.to_bytes())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            sync_dir(parent)?;
        }
        Ok(())
    }
}

/// Errors that can occur with MANIFEST operations
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// MANIFEST file too short or truncated
    #[error("MANIFEST too short")]
    TooShort,

    /// Invalid magic bytes
    #[error("Invalid magic bytes")]
    InvalidMagic,

    /// Unknown format version
    #[error("Unsupported MANIFEST format version: {0}")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected CRC32 value (from file)
        expected: u32,
        /// Computed CRC32 value
        computed: u32,
    },

    /// Contents decode but violate an invariant
    #[error("Inconsistent MANIFEST: {0}")]
    Inconsistent(String),

    /// Publishing would move the watermark backwards
    #[error("Watermark regression: current {current}, proposed {proposed}")]
    WatermarkRegression {
        /// Current watermark
        current: Lsn,
        /// Rejected watermark
        proposed: Lsn,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    /// Whether the persisted MANIFEST itself is unreadable
    pub fn is_corruption(&self) -> bool {
        !matches!(self, ManifestError::Io(_) | ManifestError::WatermarkRegression { .. })
    }
}
