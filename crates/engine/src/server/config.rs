//! Page server configuration via `pagestore.toml`
//!
//! On first start a default `pagestore.toml` with comments is written into
//! the data directory. To change settings, edit the file and restart.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pagestore_durability::{DurabilityMode, WalConfig};
use serde::{Deserialize, Serialize};

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "pagestore.toml";

/// Page server configuration loaded from `pagestore.toml`.
///
/// # Example
///
/// ```toml
/// durability = "standard"
/// wal_segment_size = 16777216
/// wal_flush_interval_ms = 100
/// checkpoint_distance = 65536
/// checkpoint_interval_ms = 10000
/// checkpoint_retry_backoff_ms = 1000
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageServerConfig {
    /// Durability mode: `"standard"` or `"always"`.
    #[serde(default = "default_durability")]
    pub durability: String,
    /// WAL segment size in bytes.
    #[serde(default = "default_wal_segment_size")]
    pub wal_segment_size: u64,
    /// Background WAL fsync interval in Standard mode.
    #[serde(default = "default_wal_flush_interval_ms")]
    pub wal_flush_interval_ms: u64,
    /// Records in the active layer that trigger a background checkpoint.
    /// 0 disables the trigger.
    #[serde(default = "default_checkpoint_distance")]
    pub checkpoint_distance: u64,
    /// Maximum time data sits in the active layer before a background
    /// checkpoint. 0 disables the timer.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    /// Wait before retrying a failed background checkpoint.
    #[serde(default = "default_checkpoint_retry_backoff_ms")]
    pub checkpoint_retry_backoff_ms: u64,
}

fn default_durability() -> String {
    "standard".to_string()
}

fn default_wal_segment_size() -> u64 {
    16 * 1024 * 1024
}

fn default_wal_flush_interval_ms() -> u64 {
    100
}

fn default_checkpoint_distance() -> u64 {
    64 * 1024
}

fn default_checkpoint_interval_ms() -> u64 {
    10_000
}

fn default_checkpoint_retry_backoff_ms() -> u64 {
    1_000
}

impl Default for PageServerConfig {
    fn default() -> Self {
        PageServerConfig {
            durability: default_durability(),
            wal_segment_size: default_wal_segment_size(),
            wal_flush_interval_ms: default_wal_flush_interval_ms(),
            checkpoint_distance: default_checkpoint_distance(),
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            checkpoint_retry_backoff_ms: default_checkpoint_retry_backoff_ms(),
        }
    }
}

impl PageServerConfig {
    /// Settings for tests: fsync every record, small segments, no
    /// background checkpoint triggers, short retry backoff.
    pub fn for_testing() -> Self {
        PageServerConfig {
            durability: "always".to_string(),
            wal_segment_size: 64 * 1024,
            wal_flush_interval_ms: 10,
            checkpoint_distance: 0,
            checkpoint_interval_ms: 0,
            checkpoint_retry_backoff_ms: 20,
        }
    }

    /// Parse the durability string into a `DurabilityMode`.
    pub fn durability_mode(&self) -> Result<DurabilityMode, ConfigError> {
        match self.durability.as_str() {
            "standard" => Ok(DurabilityMode::Standard {
                interval_ms: self.wal_flush_interval_ms,
            }),
            "always" => Ok(DurabilityMode::Always),
            other => Err(ConfigError::Invalid(format!(
                "durability mode '{}', expected \"standard\" or \"always\"",
                other
            ))),
        }
    }

    /// WAL settings derived from this config.
    pub fn wal_config(&self) -> Result<WalConfig, ConfigError> {
        let segment_size = self.wal_segment_size;
        let wal = WalConfig::new()
            .with_segment_size(segment_size)
            .with_buffered_sync_bytes(WalConfig::default().buffered_sync_bytes.min(segment_size));
        wal.validate()
            .map_err(|e| ConfigError::Invalid(format!("wal_segment_size: {}", e)))?;
        Ok(wal)
    }

    /// Background checkpoint timer, if enabled.
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_ms > 0).then(|| Duration::from_millis(self.checkpoint_interval_ms))
    }

    /// Retry backoff after a failed background checkpoint.
    pub fn checkpoint_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.checkpoint_retry_backoff_ms)
    }

    /// Check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.durability_mode()?;
        self.wal_config()?;
        if self.durability == "standard" && self.wal_flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "wal_flush_interval_ms must be > 0 in standard mode".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# pagestore configuration
#
# Durability mode: "standard" (default) or "always"
#   "standard" = WAL fsynced by a background thread every wal_flush_interval_ms
#   "always"   = WAL fsynced for every ingested record
durability = "standard"

# WAL segment size in bytes (default 16 MiB)
wal_segment_size = 16777216

# Background WAL fsync interval for "standard" mode
wal_flush_interval_ms = 100

# Records in the active layer that trigger a checkpoint (0 = off)
checkpoint_distance = 65536

# Longest time ingested data waits for a checkpoint (0 = off)
checkpoint_interval_ms = 10000

# Wait before retrying a failed background checkpoint
checkpoint_retry_backoff_ms = 1000
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PageServerConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<(), ConfigError> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Config file is not valid TOML for this schema
    #[error("failed to parse config file '{}': {detail}", path.display())]
    Parse {
        /// File path
        path: PathBuf,
        /// Parser message
        detail: String,
    },

    /// Config file could not be written
    #[error("failed to write config file '{}': {source}", path.display())]
    Write {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// A value is out of range
    #[error("invalid value: {0}")]
    Invalid(String),
}

impl From<ConfigError> for pagestore_core::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Read { source, .. } | ConfigError::Write { source, .. } => {
                pagestore_core::Error::IoError(source)
            }
            e => pagestore_core::Error::InvalidConfig(e.to_string()),
        }
    }
}
