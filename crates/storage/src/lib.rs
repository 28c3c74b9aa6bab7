//! In-memory storage layers for pagestore
//!
//! This crate holds everything about records that are not yet (or no longer
//! only) on disk:
//! - InMemoryLayer: the mutable, append-only layer receiving ingestion
//! - FrozenLayer: an immutable snapshot of an in-memory layer handed to the
//!   checkpoint engine
//! - LayerMap: the set of live layers and the merged read path
//!
//! # Freeze handoff
//!
//! Freezing swaps the active layer for an empty one and moves the old
//! records into a `FrozenLayer`. Nothing is copied and nothing is shared
//! mutably: ingestion owns the active layer, the checkpoint engine owns a
//! reference to the frozen one.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frozen;
pub mod layer_map;
pub mod memtable;

pub use frozen::FrozenLayer;
pub use layer_map::{LayerKind, LayerMap, LayerSummary};
pub use memtable::InMemoryLayer;
