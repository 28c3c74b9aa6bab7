//! Core traits for layer abstraction
//!
//! Every layer that can answer reads (the active in-memory layer, a frozen
//! in-memory layer waiting for checkpoint, an on-disk layer) implements
//! `LayerRead`. The read path merges them without knowing which is which.

use crate::types::{Key, KeyBounds, LsnRange, MutationRecord};

/// Read access to the records held by one layer
///
/// Thread safety: implementations are shared between the ingestion path,
/// the checkpoint engine and readers, so they must be Send + Sync.
pub trait LayerRead: Send + Sync {
    /// Range of positions held by this layer, `None` when empty
    fn lsn_range(&self) -> Option<LsnRange>;

    /// Latest record for `key` within this layer
    fn get(&self, key: &Key) -> Option<MutationRecord>;

    /// Latest record per key within `bounds`, in key order
    fn scan(&self, bounds: &KeyBounds) -> Vec<MutationRecord>;

    /// Number of distinct keys
    fn len(&self) -> usize;

    /// Whether the layer holds no records
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
