//! Core types: log positions, keys and mutation records
//!
//! # Ordering
//!
//! `Lsn` is the single total order of the system: every accepted mutation
//! receives a strictly larger position than the one before it. Layers are
//! tagged with the inclusive `LsnRange` they cover.
//!
//! `Key` compares bytewise, so integer keys built with [`Key::from_u64`]
//! sort numerically.

use std::fmt;
use std::ops::{Bound, RangeBounds};

/// Log sequence number: position of a mutation in the ingestion log.
///
/// `Lsn(0)` is reserved and means "nothing yet"; the first accepted
/// mutation must carry a position of at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Position before any mutation.
    pub const INVALID: Lsn = Lsn(0);

    /// Largest representable position.
    pub const MAX: Lsn = Lsn(u64::MAX);

    /// Create a position from its raw value
    pub const fn new(value: u64) -> Self {
        Lsn(value)
    }

    /// Raw value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// True for any position other than `Lsn::INVALID`
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The immediately following position
    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }

    /// Distance from `earlier` to `self`, `None` if `earlier` is after `self`
    pub fn distance_from(self, earlier: Lsn) -> Option<u64> {
        self.0.checked_sub(earlier.0)
    }
}

impl fmt::Display for Lsn {
    // Same "hi/lo" hex form the frontend prints log positions in.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffff_ffff)
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// Inclusive range of log positions `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LsnRange {
    /// First covered position
    pub start: Lsn,
    /// Last covered position
    pub end: Lsn,
}

impl LsnRange {
    /// Create a range, `None` if `start > end`
    pub fn new(start: Lsn, end: Lsn) -> Option<Self> {
        if start <= end {
            Some(LsnRange { start, end })
        } else {
            None
        }
    }

    /// Range holding exactly one position
    pub fn single(lsn: Lsn) -> Self {
        LsnRange {
            start: lsn,
            end: lsn,
        }
    }

    /// Whether `lsn` falls inside the range
    pub fn contains(&self, lsn: Lsn) -> bool {
        self.start <= lsn && lsn <= self.end
    }

    /// Extend the range to include `lsn`
    pub fn extend(&mut self, lsn: Lsn) {
        if lsn < self.start {
            self.start = lsn;
        }
        if lsn > self.end {
            self.end = lsn;
        }
    }

    /// Whether the two ranges share at least one position
    pub fn overlaps(&self, other: &LsnRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for LsnRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Page key.
///
/// Opaque bytes ordered lexicographically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key(Vec<u8>);

impl Key {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(bytes.into())
    }

    /// Key for an integer, big-endian so that byte order matches numeric order
    pub fn from_u64(value: u64) -> Self {
        Key(value.to_be_bytes().to_vec())
    }

    /// Decode a key created by [`Key::from_u64`]
    pub fn to_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key has no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the key and return its bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "Key({:?})", s),
            _ => {
                write!(f, "Key(0x")?;
                for b in &self.0 {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key(bytes)
    }
}

/// Owned key bounds, as accepted by the range read path.
pub type KeyBounds = (Bound<Key>, Bound<Key>);

/// Convert any range over keys into owned bounds
pub fn key_bounds<R: RangeBounds<Key>>(range: R) -> KeyBounds {
    (range.start_bound().cloned(), range.end_bound().cloned())
}

/// True when no key can fall within `bounds` (inverted, or empty at a single key)
pub fn bounds_are_empty(bounds: &KeyBounds) -> bool {
    match bounds {
        (Bound::Included(start), Bound::Included(end)) => start > end,
        (Bound::Included(start), Bound::Excluded(end))
        | (Bound::Excluded(start), Bound::Included(end))
        | (Bound::Excluded(start), Bound::Excluded(end)) => start >= end,
        _ => false,
    }
}

/// A decoded WAL entry.
///
/// Immutable once created. Exactly one live layer owns a record at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    /// Target page key
    pub key: Key,
    /// New page contents
    pub payload: Vec<u8>,
    /// Position assigned by the ingestion log
    pub lsn: Lsn,
}

impl MutationRecord {
    /// Create a new record
    pub fn new(key: impl Into<Key>, payload: impl Into<Vec<u8>>, lsn: impl Into<Lsn>) -> Self {
        MutationRecord {
            key: key.into(),
            payload: payload.into(),
            lsn: lsn.into(),
        }
    }

    /// Approximate in-memory footprint, used for checkpoint sizing
    pub fn footprint(&self) -> usize {
        self.key.len() + self.payload.len() + std::mem::size_of::<Lsn>()
    }
}
