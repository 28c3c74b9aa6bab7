//! Core types and traits for pagestore
//!
//! This crate defines the foundational types used throughout the system:
//! - Lsn: Log position assigned to every accepted mutation
//! - LsnRange: Inclusive range of log positions covered by a layer
//! - Key: Ordered byte key identifying a page
//! - MutationRecord: A decoded WAL entry (key, payload, lsn)
//! - Error: Error type hierarchy
//! - Traits: Read interface shared by in-memory and on-disk layers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::LayerRead;
pub use types::{bounds_are_empty, key_bounds, Key, KeyBounds, Lsn, LsnRange, MutationRecord};
