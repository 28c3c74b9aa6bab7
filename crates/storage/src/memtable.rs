//! InMemoryLayer: the mutable layer receiving ingestion
//!
//! Backed by a `BTreeMap<Key, MutationRecord>` so that serialization at
//! checkpoint time is already in key order. Each key keeps only the record
//! with the highest position seen since the layer was opened.
//!
//! The layer is single-writer: the ingestion path is the only caller of
//! `put`. It performs no locking of its own.

use std::collections::BTreeMap;

use pagestore_core::{bounds_are_empty, Error, Key, KeyBounds, LayerRead, Lsn, LsnRange, MutationRecord, Result};

use crate::frozen::FrozenLayer;

/// Mutable in-memory layer
#[derive(Debug, Default)]
pub struct InMemoryLayer {
    /// Latest record per key
    records: BTreeMap<Key, MutationRecord>,
    /// Positions held, `None` while empty
    range: Option<LsnRange>,
    /// Approximate bytes held (keys + payloads of live records)
    footprint: usize,
    /// Number of accepted appends, including overwrites
    appends: u64,
}

impl InMemoryLayer {
    /// Create a new empty layer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record
    ///
    /// The position must be strictly after every position already in the
    /// layer; anything else is rejected without modifying the layer.
    pub fn put(&mut self, record: MutationRecord) -> Result<()> {
        if let Some(range) = self.range {
            if record.lsn <= range.end {
                return Err(Error::OrderingViolation {
                    last: range.end,
                    got: record.lsn,
                });
            }
        }

        match self.range.as_mut() {
            Some(range) => range.extend(record.lsn),
            None => self.range = Some(LsnRange::single(record.lsn)),
        }

        self.footprint += record.footprint();
        if let Some(old) = self.records.insert(record.key.clone(), record) {
            self.footprint -= old.footprint();
        }
        self.appends += 1;
        Ok(())
    }

    /// Highest position held
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.range.map(|r| r.end)
    }

    /// Number of accepted appends since the layer was opened
    pub fn appends(&self) -> u64 {
        self.appends
    }

    /// Approximate bytes held
    pub fn footprint(&self) -> usize {
        self.footprint
    }

    /// Turn the layer into its immutable form
    pub fn freeze(self) -> FrozenLayer {
        FrozenLayer::new(self.records, self.range, self.appends)
    }
}

impl LayerRead for InMemoryLayer {
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

#[cfg(test)]
mod tests {
    use super::*;
    use pagestore_core::key_bounds;

    fn record(key: u64, payload: &str, lsn: u64) -> MutationRecord {
        MutationRecord::new(Key::from_u64(key), payload.as_bytes(), lsn)
    }

    #[test]
    fn test_new_layer_is_empty() {
        let layer = InMemoryLayer::new();
        assert!(layer.is_empty());
        assert_eq!(layer.lsn_range(), None);
        assert_eq!(layer.last_lsn(), None);
        assert_eq!(layer.footprint(), 0);
    }

    #[test]
    fn test_put_tracks_range() {
        let mut layer = InMemoryLayer::new();
        layer.put(record(1, "a", 10)).unwrap();
        layer.put(record(2, "b", 11)).unwrap();
        layer.put(record(1, "c", 15)).unwrap();

        assert_eq!(layer.lsn_range(), LsnRange::new(Lsn(10), Lsn(15)));
        assert_eq!(layer.len(), 2);
        assert_eq!(layer.appends(), 3);
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let mut layer = InMemoryLayer::new();
        layer.put(record(7, "old", 1)).unwrap();
        layer.put(record(7, "new", 2)).unwrap();

        let found = layer.get(&Key::from_u64(7)).unwrap();
        assert_eq!(found.payload, b"new".to_vec());
        assert_eq!(found.lsn, Lsn(2));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut layer = InMemoryLayer::new();
        layer.put(record(1, "a", 5)).unwrap();

        let err = layer.put(record(2, "b", 5)).unwrap_err();
        assert!(matches!(err, Error::OrderingViolation { last: Lsn(5), got: Lsn(5) }));

        let err = layer.put(record(2, "b", 3)).unwrap_err();
        assert!(matches!(err, Error::OrderingViolation { .. }));

        // Rejected records leave no trace
        assert_eq!(layer.len(), 1);
        assert_eq!(layer.appends(), 1);
        assert!(layer.get(&Key::from_u64(2)).is_none());
    }

    #[test]
    fn test_footprint_accounts_for_overwrite() {
        let mut layer = InMemoryLayer::new();
        layer.put(record(1, "aaaa", 1)).unwrap();
        let after_first = layer.footprint();
        layer.put(record(1, "bb", 2)).unwrap();
        assert_eq!(layer.footprint(), after_first - 2);
    }

    #[test]
    fn test_scan_in_key_order() {
        let mut layer = InMemoryLayer::new();
        layer.put(record(3, "c", 1)).unwrap();
        layer.put(record(1, "a", 2)).unwrap();
        layer.put(record(2, "b", 3)).unwrap();
        layer.put(record(9, "z", 4)).unwrap();

        let scanned = layer.scan(&key_bounds(Key::from_u64(1)..Key::from_u64(9)));
        let keys: Vec<u64> = scanned.iter().filter_map(|r| r.key.to_u64()).collect();
        assert_eq!(keys, vec![1, 2, 3]);
    }

    #[test]
    fn test_scan_inverted_or_empty_bounds() {
        let mut layer = InMemoryLayer::new();
        for key in 1..=9u64 {
            layer.put(record(key, "v", key)).unwrap();
        }
        assert!(layer.scan(&key_bounds(Key::from_u64(6)..Key::from_u64(2))).is_empty());
        assert!(layer.scan(&key_bounds(Key::from_u64(4)..Key::from_u64(4))).is_empty());
        assert_eq!(layer.scan(&key_bounds(Key::from_u64(4)..=Key::from_u64(4))).len(), 1);

        let frozen = layer.freeze();
        assert!(frozen.scan(&key_bounds(Key::from_u64(6)..Key::from_u64(2))).is_empty());
    }

    #[test]
    fn test_freeze_preserves_contents() {
        let mut layer = InMemoryLayer::new();
        layer.put(record(1, "a", 1)).unwrap();
        layer.put(record(2, "b", 2)).unwrap();

        let frozen = layer.freeze();
        assert_eq!(frozen.len(), 2);
        assert_eq!(frozen.lsn_range(), LsnRange::new(Lsn(1), Lsn(2)));
        assert_eq!(frozen.get(&Key::from_u64(2)).unwrap().payload, b"b".to_vec());
    }
}
