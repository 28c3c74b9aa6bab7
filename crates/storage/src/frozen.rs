//! FrozenLayer: immutable snapshot of an in-memory layer
//!
//! Created exactly once per in-memory layer, when a checkpoint begins.
//! Readers keep seeing it until the on-disk layer that replaces it has been
//! published; the checkpoint engine serializes it from `iter()`.

use std::collections::BTreeMap;

use pagestore_core::{bounds_are_empty, Key, KeyBounds, LayerRead, LsnRange, MutationRecord};

/// Read-only in-memory layer waiting to be checkpointed
#[derive(Debug)]
pub struct FrozenLayer {
    records: BTreeMap<Key, MutationRecord>,
    range: Option<LsnRange>,
    appends: u64,
}

impl FrozenLayer {
    pub(crate) fn new(
        records: BTreeMap<Key, MutationRecord>,
        range: Option<LsnRange>,
        appends: u64,
    ) -> Self {
        FrozenLayer {
            records,
            range,
            appends,
        }
    }

    /// Records in key order, one per key
    pub fn iter(&self) -> impl Iterator<Item = &MutationRecord> + '_ {
        self.records.values()
    }

    /// Number of appends the layer absorbed while it was mutable
    pub fn appends(&self) -> u64 {
        self.appends
    }
}

impl LayerRead for FrozenLayer {
    fn lsn_range(&self) -> Option<LsnRange> {
        self.range
    }

    fn get(&self, key: &Key) -> Option<MutationRecord> {
        self.records.get(key).cloned()
    }

    fn scan(&self, bounds: &KeyBounds) -> Vec<MutationRecord> {
        if bounds_are_empty(bounds) {
            return Vec::new();
        }
        self.records
            .range((bounds.0.as_ref(), bounds.1.as_ref()))
            .map(|(_, record)| record.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
