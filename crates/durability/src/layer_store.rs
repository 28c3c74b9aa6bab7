//! Layer Store: immutable on-disk layers plus the MANIFEST
//!
//! A checkpoint goes through the store in three steps:
//!
//! 1. `append_layer` writes a new `layer-NNNNNN.lyr` file (not synced,
//!    not referenced)
//! 2. `sync_layer` fsyncs the file and the layers directory
//! 3. `publish` atomically replaces the MANIFEST with one that lists the
//!    layer and carries the advanced watermark
//!
//! A crash anywhere before step 3 completes leaves at most an unreferenced
//! file, which recovery deletes. Layer files are never modified after
//! step 1 and never deleted while referenced.

use std::fs::File;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use pagestore_core::{Key, KeyBounds, LayerRead, Lsn, LsnRange, MutationRecord};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::format::{
    layer_path, parse_layer_name, read_layer_file, write_layer_file, LayerFileError,
    LayerFileHeader, ManifestError, ManifestLayer, ManifestManager,
};
use crate::paths::{sync_dir, DatabasePaths};

/// A written layer file that has not been published yet
#[derive(Debug)]
pub struct LayerHandle {
    header: LayerFileHeader,
    path: PathBuf,
    file: File,
    synced: bool,
}

impl LayerHandle {
    /// Allocated layer id
    pub fn layer_id(&self) -> u64 {
        self.header.layer_id
    }

    /// Positions covered
    pub fn range(&self) -> LsnRange {
        self.header.range
    }

    /// Number of entries written
    pub fn entry_count(&self) -> u64 {
        self.header.entry_count
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `LayerStore::sync_layer` completed
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Read view of a published layer, built from the records it was
    /// written from instead of reading the file back
    ///
    /// `records` must be the key-ordered records passed to `append_layer`.
    pub fn into_disk_layer(self, records: Vec<MutationRecord>) -> DiskLayer {
        debug_assert_eq!(records.len() as u64, self.header.entry_count);
        DiskLayer {
            header: self.header,
            records,
        }
    }
}

/// Durable repository of on-disk layers
pub struct LayerStore {
    layers_dir: PathBuf,
    manifest: Mutex<ManifestManager>,
    next_layer_id: AtomicU64,
}

impl LayerStore {
    /// Create a store with a fresh MANIFEST
    pub fn create(paths: &DatabasePaths, database_uuid: [u8; 16]) -> Result<Self, LayerStoreError> {
        paths.create_directories()?;
        let manager = ManifestManager::create(paths.manifest(), database_uuid)?;
        info!(
            target: "pagestore::recovery",
            uuid = %uuid::Uuid::from_bytes(database_uuid),
            "Created new MANIFEST"
        );
        Ok(Self::from_manager(paths, manager))
    }

    /// Open the store over an existing MANIFEST
    pub fn load(paths: &DatabasePaths) -> Result<Self, LayerStoreError> {
        paths.create_directories()?;
        let manager = ManifestManager::load(paths.manifest())?;
        Ok(Self::from_manager(paths, manager))
    }

    fn from_manager(paths: &DatabasePaths, manager: ManifestManager) -> Self {
        let next = manager.manifest().next_layer_id;
        LayerStore {
            layers_dir: paths.layers_dir(),
            manifest: Mutex::new(manager),
            next_layer_id: AtomicU64::new(next),
        }
    }

    /// Identifier of the data directory
    pub fn database_uuid(&self) -> [u8; 16] {
        self.manifest.lock().manifest().database_uuid
    }

    /// Highest position known durable
    pub fn durable_watermark(&self) -> Lsn {
        self.manifest.lock().manifest().durable_watermark
    }

    /// Live layers ordered by position range
    pub fn list_live_layers(&self) -> Vec<ManifestLayer> {
        self.manifest.lock().manifest().layers.clone()
    }

    /// Layer file directory
    pub fn layers_dir(&self) -> &Path {
        &self.layers_dir
    }

    /// Write `records` (key order, `entry_count` of them) to a new layer file
    ///
    /// Every attempt gets a fresh layer id, so a retry never reuses the
    /// file of a failed attempt.
    pub fn append_layer<'a>(
        &self,
        records: impl IntoIterator<Item = &'a MutationRecord>,
        entry_count: u64,
        range: LsnRange,
    ) -> Result<LayerHandle, LayerStoreError> {
        let layer_id = self.next_layer_id.fetch_add(1, Ordering::SeqCst);
        let path = layer_path(&self.layers_dir, layer_id);
        let header = LayerFileHeader::new(layer_id, range, entry_count);

        let file = match write_layer_file(&path, &header, records) {
            Ok(file) => file,
            Err(source) => {
                remove_quietly(&path);
                return Err(LayerStoreError::LayerFile { layer_id, source });
            }
        };

        debug!(
            target: "pagestore::checkpoint",
            layer_id,
            entries = entry_count,
            range = %range,
            "Wrote layer file"
        );

        Ok(LayerHandle {
            header,
            path,
            file,
            synced: false,
        })
    }

    /// fsync the layer file and its directory entry
    pub fn sync_layer(&self, handle: &mut LayerHandle) -> Result<(), LayerStoreError> {
        handle.file.sync_all()?;
        sync_dir(&self.layers_dir)?;
        handle.synced = true;
        Ok(())
    }

    /// Delete an unpublished layer file after a failed checkpoint attempt
    pub fn discard(&self, handle: LayerHandle) {
        let layer_id = handle.layer_id();
        let LayerHandle { path, file, .. } = handle;
        drop(file);
        remove_quietly(&path);
        debug!(target: "pagestore::checkpoint", layer_id, "Discarded unpublished layer file");
    }

    /// Atomically add the layer to the MANIFEST and advance the watermark
    ///
    /// `watermark` must be the layer's highest position and must not be
    /// below the current watermark.
    pub fn publish(&self, handle: &LayerHandle, watermark: Lsn) -> Result<(), LayerStoreError> {
        if !handle.is_synced() {
            return Err(LayerStoreError::NotSynced(handle.layer_id()));
        }
        if watermark != handle.range().end {
            return Err(LayerStoreError::WatermarkMismatch {
                layer_id: handle.layer_id(),
                range: handle.range(),
                watermark,
            });
        }

        let mut manager = self.manifest.lock();
        manager.publish_layer(
            ManifestLayer {
                layer_id: handle.layer_id(),
                range: handle.range(),
            },
            handle.layer_id() + 1,
        )?;

        info!(
            target: "pagestore::checkpoint",
            layer_id = handle.layer_id(),
            range = %handle.range(),
            watermark = %watermark,
            "Published layer"
        );
        Ok(())
    }

    /// Load a live layer into memory, checking it against the MANIFEST
    pub fn open_layer(&self, layer: &ManifestLayer) -> Result<DiskLayer, LayerStoreError> {
        let path = layer_path(&self.layers_dir, layer.layer_id);
        let (header, records) =
            read_layer_file(&path).map_err(|source| LayerStoreError::LayerFile {
                layer_id: layer.layer_id,
                source,
            })?;

        if header.layer_id != layer.layer_id || header.range != layer.range {
            return Err(LayerStoreError::LayerMismatch {
                layer_id: layer.layer_id,
                detail: format!(
                    "file header says layer {} range {}, MANIFEST says range {}",
                    header.layer_id, header.range, layer.range
                ),
            });
        }

        Ok(DiskLayer { header, records })
    }

    /// Delete layer files the MANIFEST does not reference
    ///
    /// Must not run while a checkpoint is in flight. Returns the removed
    /// paths.
    pub fn remove_orphans(&self) -> Result<Vec<PathBuf>, LayerStoreError> {
        let referenced: Vec<u64> = self
            .list_live_layers()
            .iter()
            .map(|l| l.layer_id)
            .collect();

        let mut removed = Vec::new();
        for entry in std::fs::read_dir(&self.layers_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(layer_id) = parse_layer_name(name) else {
                continue;
            };
            if referenced.contains(&layer_id) {
                continue;
            }

            let path = entry.path();
            std::fs::remove_file(&path)?;
            warn!(
                target: "pagestore::recovery",
                layer_id,
                path = %path.display(),
                "Removed orphan layer file"
            );
            removed.push(path);
        }

        if !removed.is_empty() {
            sync_dir(&self.layers_dir)?;
        }
        Ok(removed)
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            target: "pagestore::checkpoint",
            path = %path.display(),
            error = %e,
            "Failed to remove layer file"
        ),
    }
}

/// A published layer, loaded for reads
///
/// Entries are kept sorted by key; lookups binary-search them.
#[derive(Debug)]
pub struct DiskLayer {
    header: LayerFileHeader,
    records: Vec<MutationRecord>,
}

impl DiskLayer {
    /// Layer identifier
    pub fn layer_id(&self) -> u64 {
        self.header.layer_id
    }

    /// File header
    pub fn header(&self) -> &LayerFileHeader {
        &self.header
    }

    fn lower_index(&self, bound: &Bound<Key>) -> usize {
        match bound {
            Bound::Included(k) => self.records.partition_point(|r| &r.key < k),
            Bound::Excluded(k) => self.records.partition_point(|r| &r.key <= k),
            Bound::Unbounded => 0,
        }
    }

    fn upper_index(&self, bound: &Bound<Key>) -> usize {
        match bound {
            Bound::Included(k) => self.records.partition_point(|r| &r.key <= k),
            Bound::Excluded(k) => self.records.partition_point(|r| &r.key < k),
            Bound::Unbounded => self.records.len(),
        }
    }
}

impl LayerRead for DiskLayer {
    fn lsn_range(&self) -> Option<LsnRange> {
        Some(self.header.range)
    }

    fn get(&self, key: &Key) -> Option<MutationRecord> {
        self.records
            .binary_search_by(|r| r.key.cmp(key))
            .ok()
            .map(|idx| self.records[idx].clone())
    }

    fn scan(&self, bounds: &KeyBounds) -> Vec<MutationRecord> {
        let lo = self.lower_index(&bounds.0);
        let hi = self.upper_index(&bounds.1);
        if lo >= hi {
            return Vec::new();
        }
        self.records[lo..hi].to_vec()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Layer store errors
#[derive(Debug, thiserror::Error)]
pub enum LayerStoreError {
    /// MANIFEST could not be read or written
    #[error("MANIFEST error: {0}")]
    Manifest(#[from] ManifestError),

    /// A layer file could not be written or read back
    #[error("Layer {layer_id}: {source}")]
    LayerFile {
        /// Layer id
        layer_id: u64,
        /// Underlying error
        source: LayerFileError,
    },

    /// A live layer's file disagrees with the MANIFEST
    #[error("Layer {layer_id} does not match MANIFEST: {detail}")]
    LayerMismatch {
        /// Layer id
        layer_id: u64,
        /// What differs
        detail: String,
    },

    /// Publish attempted before the file was synced
    #[error("Layer {0} published before sync")]
    NotSynced(u64),

    /// Publish watermark is not the layer's end position
    #[error("Watermark {watermark} does not match layer {layer_id} range {range}")]
    WatermarkMismatch {
        /// Layer id
        layer_id: u64,
        /// Layer range
        range: LsnRange,
        /// Requested watermark
        watermark: Lsn,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LayerStoreError> for pagestore_core::Error {
    fn from(err: LayerStoreError) -> Self {
        use pagestore_core::Error;
        match err {
            LayerStoreError::Manifest(ManifestError::Io(e)) => Error::IoError(e),
            LayerStoreError::Manifest(e) if e.is_corruption() => {
                Error::ManifestCorrupted(e.to_string())
            }
            LayerStoreError::Manifest(e) => Error::storage(e.to_string()),
            LayerStoreError::LayerFile {
                source: LayerFileError::Io(e),
                ..
            } => Error::IoError(e),
            e @ LayerStoreError::LayerFile { .. } | e @ LayerStoreError::LayerMismatch { .. } => {
                Error::corruption(e.to_string())
            }
            LayerStoreError::Io(e) => Error::IoError(e),
            e => Error::storage(e.to_string()),
        }
    }
}
