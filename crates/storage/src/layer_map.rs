//! LayerMap: the live layers and the merged read path
//!
//! At any moment the live layers are:
//!
//! ```text
//! historic[0] < historic[1] < ... < frozen (optional) < active
//! ```
//!
//! ordered by the positions they hold. Position ranges never overlap, so for
//! a point lookup the first layer that has the key, searching newest first,
//! holds its latest record.
//!
//! The map itself is not synchronized; the engine wraps it in a `RwLock`
//! and holds the write lock only for `insert`, `freeze` and
//! `complete_checkpoint`.

use std::collections::BTreeMap;
use std::sync::Arc;

use pagestore_core::{bounds_are_empty, Error, Key, KeyBounds, LayerRead, Lsn, LsnRange, MutationRecord, Result};
use tracing::debug;

use crate::frozen::FrozenLayer;
use crate::memtable::InMemoryLayer;

/// Where a live layer currently sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Receiving ingestion
    Active,
    /// Frozen, checkpoint pending
    Frozen,
    /// Published on disk
    Historic,
}

/// Summary of one live layer, for status reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSummary {
    /// Layer position in the map
    pub kind: LayerKind,
    /// Positions held
    pub range: Option<LsnRange>,
    /// Distinct keys held
    pub keys: usize,
}

/// Set of live layers
pub struct LayerMap {
    active: InMemoryLayer,
    frozen: Option<Arc<FrozenLayer>>,
    historic: Vec<Arc<dyn LayerRead>>,
    last_lsn: Lsn,
}

impl LayerMap {
    /// Create an empty map
    pub fn new() -> Self {
        LayerMap {
            active: InMemoryLayer::new(),
            frozen: None,
            historic: Vec::new(),
            last_lsn: Lsn::INVALID,
        }
    }

    /// Create a map over already-published layers
    ///
    /// `historic` must be ordered by position range. `last_lsn` is the
    /// highest position those layers cover.
    pub fn with_historic(historic: Vec<Arc<dyn LayerRead>>, last_lsn: Lsn) -> Self {
        LayerMap {
            active: InMemoryLayer::new(),
            frozen: None,
            historic,
            last_lsn,
        }
    }

    /// Highest position accepted so far
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// Append a record to the active layer
    pub fn insert(&mut self, record: MutationRecord) -> Result<()> {
        if record.lsn <= self.last_lsn {
            return Err(Error::OrderingViolation {
                last: self.last_lsn,
                got: record.lsn,
            });
        }
        let lsn = record.lsn;
        self.active.put(record)?;
        self.last_lsn = lsn;
        Ok(())
    }

    /// Number of appends absorbed by the active layer
    pub fn active_appends(&self) -> u64 {
        self.active.appends()
    }

    /// Layer waiting for its checkpoint to publish, if any
    pub fn pending_frozen(&self) -> Option<Arc<FrozenLayer>> {
        self.frozen.clone()
    }

    /// Freeze the active layer for checkpointing
    ///
    /// If a frozen layer is still pending (its previous checkpoint failed),
    /// that layer is returned again and the active layer is left alone, so
    /// at most one frozen layer exists. Returns `None` when there is nothing
    /// to checkpoint.
    pub fn freeze(&mut self) -> Option<Arc<FrozenLayer>> {
        if let Some(frozen) = &self.frozen {
            return Some(Arc::clone(frozen));
        }
        if self.active.is_empty() {
            return None;
        }

        let active = std::mem::take(&mut self.active);
        let footprint = active.footprint();
        let frozen = Arc::new(active.freeze());
        debug!(
            target: "pagestore::layers",
            keys = frozen.len(),
            bytes = footprint,
            range = ?frozen.lsn_range(),
            "Froze in-memory layer"
        );
        self.frozen = Some(Arc::clone(&frozen));
        Some(frozen)
    }

    /// Replace a frozen layer with its published on-disk counterpart
    ///
    /// Returns false (and changes nothing) if `frozen` is not the pending
    /// frozen layer.
    pub fn complete_checkpoint(
        &mut self,
        frozen: &Arc<FrozenLayer>,
        published: Arc<dyn LayerRead>,
    ) -> bool {
        match &self.frozen {
            Some(pending) if Arc::ptr_eq(pending, frozen) => {
                self.historic.push(published);
                self.frozen = None;
                true
            }
            _ => false,
        }
    }

    /// Latest record for `key` across all live layers
    pub fn get(&self, key: &Key) -> Option<MutationRecord> {
        if let Some(record) = self.active.get(key) {
            return Some(record);
        }
        if let Some(record) = self.frozen.as_ref().and_then(|f| f.get(key)) {
            return Some(record);
        }
        self.historic.iter().rev().find_map(|layer| layer.get(key))
    }

    /// Latest record per key within `bounds`, in key order
    pub fn scan(&self, bounds: &KeyBounds) -> Vec<MutationRecord> {
        if bounds_are_empty(bounds) {
            return Vec::new();
        }
        let mut merged: BTreeMap<Key, MutationRecord> = BTreeMap::new();

        let mut layers: Vec<&dyn LayerRead> = Vec::with_capacity(self.historic.len() + 2);
        for layer in &self.historic {
            layers.push(layer.as_ref());
        }
        if let Some(frozen) = &self.frozen {
            layers.push(frozen.as_ref());
        }
        layers.push(&self.active);

        for layer in layers {
            for record in layer.scan(bounds) {
                match merged.get(&record.key) {
                    Some(existing) if existing.lsn >= record.lsn => {}
                    _ => {
                        merged.insert(record.key.clone(), record);
                    }
                }
            }
        }

        merged.into_values().collect()
    }

    /// Number of published layers
    pub fn historic_count(&self) -> usize {
        self.historic.len()
    }

    /// Summaries of all live layers, oldest first
    pub fn summaries(&self) -> Vec<LayerSummary> {
        let mut out: Vec<LayerSummary> = self
            .historic
            .iter()
            .map(|l| LayerSummary {
                kind: LayerKind::Historic,
                range: l.lsn_range(),
                keys: l.len(),
            })
            .collect();
        if let Some(frozen) = &self.frozen {
            out.push(LayerSummary {
                kind: LayerKind::Frozen,
                range: frozen.lsn_range(),
                keys: frozen.len(),
            });
        }
        out.push(LayerSummary {
            kind: LayerKind::Active,
            range: self.active.lsn_range(),
            keys: self.active.len(),
        });
        out
    }
}

impl Default for LayerMap {
    fn default() -> Self {
        Self::new()
    }
}
