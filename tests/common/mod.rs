//! Shared test utilities for the integration test suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's
//! main.rs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

pub use pagestore::{
    CheckpointOutcome, Error, FailAction, FailpointRegistry, Key, Lsn, MutationRecord,
    PageServer, PageServerConfig, CHECKPOINT_AFTER_SYNC, CHECKPOINT_BEFORE_SYNC,
};
use tempfile::TempDir;

// ============================================================================
// Initialization
// ============================================================================

static INIT_TRACING: Once = Once::new();

/// Print pagestore logs through the test harness writer
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Records
// ============================================================================

/// Record for integer key `key` at position `lsn`
pub fn record(key: u64, lsn: u64) -> MutationRecord {
    MutationRecord::new(Key::from_u64(key), payload(key, lsn), lsn)
}

/// Payload that names both the key and the position it was written at
pub fn payload(key: u64, lsn: u64) -> Vec<u8> {
    format!("key={};lsn={}", key, lsn).into_bytes()
}

// ============================================================================
// TestServer - restartable server over a temp directory
// ============================================================================

/// Page server over a temp directory that survives restarts
pub struct TestServer {
    pub dir: TempDir,
    pub config: PageServerConfig,
    pub failpoints: Option<Arc<FailpointRegistry>>,
    server: Option<PageServer>,
}

impl TestServer {
    /// Fresh server with test settings (fsync every record, no background
    /// checkpoints)
    pub fn new() -> Self {
        Self::with_config(PageServerConfig::for_testing())
    }

    /// Fresh server with an explicit configuration
    pub fn with_config(config: PageServerConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let mut test = TestServer {
            dir,
            config,
            failpoints: None,
            server: None,
        };
        test.start();
        test
    }

    /// Fresh server consulting a failpoint registry
    pub fn with_failpoints() -> (Self, Arc<FailpointRegistry>) {
        init_tracing();
        let registry = Arc::new(FailpointRegistry::new());
        let mut test = TestServer {
            dir: TempDir::new().unwrap(),
            config: PageServerConfig::for_testing(),
            failpoints: Some(Arc::clone(&registry)),
            server: None,
        };
        test.start();
        (test, registry)
    }

    /// The running server
    pub fn server(&self) -> &PageServer {
        self.server.as_ref().expect("server is not running")
    }

    /// Stop the server (drop releases the directory lock)
    pub fn shutdown(&mut self) {
        if let Some(server) = self.server.take() {
            server.stop().unwrap();
        }
    }

    /// Start a server over the same directory
    pub fn start(&mut self) {
        assert!(self.server.is_none());
        self.server = Some(self.try_start().unwrap());
    }

    /// Start, returning the error instead of panicking
    pub fn try_start(&self) -> pagestore::Result<PageServer> {
        PageServer::start_with(self.dir.path(), self.config.clone(), self.failpoints.clone())
    }

    /// Stop and start again
    pub fn restart(&mut self) {
        self.shutdown();
        self.start();
    }

    /// Data directory
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.path().join("MANIFEST")
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.dir.path().join("layers")
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.dir.path().join("wal")
    }

    /// Ingest `key` for every key in `keys`, at consecutive positions
    /// starting after the last accepted one. Returns the last position.
    pub fn ingest_keys(&self, keys: impl IntoIterator<Item = u64>) -> Lsn {
        let server = self.server();
        let mut lsn = server.last_record_lsn().as_u64();
        for key in keys {
            lsn += 1;
            server.ingest(record(key, lsn)).unwrap();
        }
        Lsn(lsn)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.take();
    }
}

// ============================================================================
// File helpers
// ============================================================================

/// Files in `dir` whose names end with `suffix`, sorted
pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.ends_with(suffix))
        })
        .collect();
    files.sort();
    files
}

/// Flip every bit of the byte at `offset`
pub fn flip_byte(path: &Path, offset: usize) {
    let mut bytes = std::fs::read(path).unwrap();
    bytes[offset] ^= 0xFF;
    std::fs::write(path, bytes).unwrap();
}

/// Append raw bytes to a file
pub fn append_bytes(path: &Path, extra: &[u8]) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(extra).unwrap();
    file.sync_all().unwrap();
}
