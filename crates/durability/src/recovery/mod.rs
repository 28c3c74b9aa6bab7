//! Crash recovery
//!
//! - `coordinator`: MANIFEST + layers + WAL tail recovery (RecoveryCoordinator)

pub mod coordinator;

pub use coordinator::{
    RecoveryCoordinator, RecoveryError, RecoveryPlan, RecoveryResult, RecoveryStats,
};
