//! Crash recovery integration tests
//!
//! - `process_abort`: a child process is killed by the after-sync abort
//!   failpoint in the middle of a checkpoint; the parent restarts the
//!   server over the same directory and checks nothing was lost
//! - `scenarios`: restart scenarios run in-process (full replay, disjoint
//!   checkpoints, retryable failures, orphans, torn WAL tails)
//! - `corruption`: damaged MANIFEST and layer files

#[path = "../common/mod.rs"]
mod common;

mod corruption;
mod process_abort;
mod scenarios;
