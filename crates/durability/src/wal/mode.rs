//! Durability mode configuration
//!
//! Controls when the ingestion WAL is fsynced.

/// Durability mode for WAL appends
///
/// | Mode | fsync | Data Loss Window (power loss) |
/// |------|-------|-------------------------------|
/// | Always | Every append | Zero |
/// | Standard | Periodic | Up to `interval_ms` |
///
/// A process crash loses nothing in either mode: appended bytes are in the
/// OS page cache once `append` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// fsync after every append
    Always,

    /// fsync from the background flush thread, at least every `interval_ms`
    Standard {
        /// Maximum time between fsyncs in milliseconds
        interval_ms: u64,
    },
}

impl DurabilityMode {
    /// Whether every append is synced before it returns
    pub fn requires_immediate_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// Interval for the background flush thread, if one is needed
    pub fn flush_interval_ms(&self) -> Option<u64> {
        match self {
            DurabilityMode::Always => None,
            DurabilityMode::Standard { interval_ms } => Some(*interval_ms),
        }
    }

    /// Human-readable description of the mode
    pub fn description(&self) -> &'static str {
        match self {
            DurabilityMode::Always => "Always sync (safest, slowest)",
            DurabilityMode::Standard { .. } => "Standard (periodic background sync)",
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Standard { interval_ms: 100 }
    }
}
