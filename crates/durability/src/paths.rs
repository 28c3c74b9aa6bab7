//! Data directory structure
//!
//! All server state lives in one directory:
//!
//! ```text
//! <data dir>/
//! ├── MANIFEST            # Live layers + durable watermark
//! ├── pagestore.toml      # Server configuration
//! ├── .lock               # Exclusive lock while a server runs
//! ├── wal/                # Ingestion log segments
//! │   ├── wal-000001.seg
//! │   └── ...
//! └── layers/             # Immutable on-disk layers
//!     ├── layer-000001.lyr
//!     └── ...
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};

/// Data directory paths
#[derive(Debug, Clone)]
pub struct DatabasePaths {
    root: PathBuf,
}

impl DatabasePaths {
    /// Create paths from root directory
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        DatabasePaths {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root data directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// MANIFEST file path
    pub fn manifest(&self) -> PathBuf {
        self.root.join("MANIFEST")
    }

    /// Configuration file path
    pub fn config(&self) -> PathBuf {
        self.root.join("pagestore.toml")
    }

    /// Lock file path
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// WAL directory
    pub fn wal_dir(&self) -> PathBuf {
        self.root.join("wal")
    }

    /// Layer file directory
    pub fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    /// Whether a server has ever run here
    ///
    /// A data directory exists once its MANIFEST has been written.
    pub fn exists(&self) -> bool {
        self.manifest().exists()
    }

    /// Create the full directory structure
    pub fn create_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.wal_dir())?;
        std::fs::create_dir_all(self.layers_dir())?;
        Ok(())
    }
}

/// fsync a directory so that entries created, renamed or removed in it
/// survive a crash
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}
