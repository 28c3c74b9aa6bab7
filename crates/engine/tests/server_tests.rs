//! Page server tests
//!
//! Lifecycle, ingestion, reads and checkpoints through the public
//! `PageServer` API. Restarts drop the server (no crash); the process
//! abort path lives in the root crate's crash_recovery tests.

use std::ops::Bound;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pagestore_core::{Error, Key, Lsn, MutationRecord};
use pagestore_durability::{FailAction, FailpointRegistry, CHECKPOINT_BEFORE_SYNC, MAX_RECORD_LEN};
use pagestore_engine::{
    CheckpointOutcome, PageServer, PageServerConfig, ServerState, CONFIG_FILE_NAME,
};
use tempfile::TempDir;

fn record(key: u64, lsn: u64) -> MutationRecord {
    MutationRecord::new(Key::from_u64(key), format!("v{}", lsn).into_bytes(), lsn)
}

fn start(dir: &TempDir) -> PageServer {
    PageServer::start_with(dir.path(), PageServerConfig::for_testing(), None).unwrap()
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_start_writes_default_config() {
    let dir = TempDir::new().unwrap();
    let server = PageServer::start(dir.path()).unwrap();
    assert_eq!(server.state(), ServerState::Serving);
    assert!(dir.path().join(CONFIG_FILE_NAME).exists());
    assert_eq!(server.config(), &PageServerConfig::default());
    assert!(server.recovery_stats().fresh);
}

#[test]
fn test_second_server_on_same_dir_rejected() {
    let dir = TempDir::new().unwrap();
    let _server = start(&dir);
    let second = PageServer::start_with(dir.path(), PageServerConfig::for_testing(), None);
    assert!(matches!(second, Err(Error::StorageError(_))));
}

#[test]
fn test_stop_rejects_ingest_and_reads() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir);
    server.ingest(record(1, 1)).unwrap();
    server.stop().unwrap();
    server.stop().unwrap();

    assert_eq!(server.state(), ServerState::Stopped);
    assert!(matches!(server.ingest(record(2, 2)), Err(Error::NotServing(_))));
    assert!(matches!(server.get(&Key::from_u64(1)), Err(Error::NotServing(_))));
    assert!(matches!(server.checkpoint(), Err(Error::NotServing(_))));
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let config = PageServerConfig {
        durability: "sometimes".to_string(),
        ..PageServerConfig::for_testing()
    };
    let result = PageServer::start_with(dir.path(), config, None);
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

// ============================================================================
// Ingestion and reads
// ============================================================================

#[test]
fn test_ordering_violation_rejected() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir);
    server.ingest(record(1, 10)).unwrap();

    let err = server.ingest(record(2, 10)).unwrap_err();
    assert!(matches!(
        err,
        Error::OrderingViolation { last: Lsn(10), got: Lsn(10) }
    ));
    assert!(server.ingest(record(2, 9)).is_err());
    assert!(server.get(&Key::from_u64(2)).unwrap().is_none());
    assert_eq!(server.last_record_lsn(), Lsn(10));

    server.ingest(record(2, 11)).unwrap();
    assert_eq!(server.last_record_lsn(), Lsn(11));
}

#[test]
fn test_position_zero_rejected() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir);
    assert!(matches!(
        server.ingest(record(1, 0)),
        Err(Error::OrderingViolation { .. })
    ));
}

#[test]
fn test_reads_merge_memory_and_disk() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir);

    for lsn in 1..=10 {
        server.ingest(record(lsn, lsn)).unwrap();
    }
    server.checkpoint().unwrap();
    server.ingest(record(3, 11)).unwrap();
    server.ingest(record(20, 12)).unwrap();

    assert_eq!(server.get(&Key::from_u64(3)).unwrap().unwrap().lsn, Lsn(11));
    assert_eq!(server.get(&Key::from_u64(4)).unwrap().unwrap().lsn, Lsn(4));
    assert!(server.get(&Key::from_u64(15)).unwrap().is_none());

    let scanned = server.range(Key::from_u64(2)..Key::from_u64(5)).unwrap();
    let lsns: Vec<u64> = scanned.iter().map(|r| r.lsn.as_u64()).collect();
    assert_eq!(lsns, vec![2, 11, 4]);
    assert_eq!(server.range(..).unwrap().len(), 11);
}

#[test]
fn test_inverted_and_empty_ranges_read_nothing() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir);
    for key in 1..=9 {
        server.ingest(record(key, key)).unwrap();
    }
    // One layer on disk, the overwrites below in memory
    server.checkpoint().unwrap();
    for key in 1..=9 {
        server.ingest(record(key, 9 + key)).unwrap();
    }

    let k = Key::from_u64;
    assert!(server.range(k(6)..k(2)).unwrap().is_empty());
    assert!(server.range(k(4)..k(4)).unwrap().is_empty());
    assert!(server
        .range((Bound::Excluded(k(4)), Bound::Excluded(k(4))))
        .unwrap()
        .is_empty());
    assert_eq!(server.range(k(4)..=k(4)).unwrap().len(), 1);
    assert_eq!(server.state(), ServerState::Serving);
}

#[test]
fn test_oversized_record_rejected_before_wal() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir);
    server.ingest(record(1, 1)).unwrap();

    let huge = MutationRecord::new(Key::from_u64(2), vec![7u8; MAX_RECORD_LEN], 2u64);
    let err = server.ingest(huge).unwrap_err();
    assert!(matches!(
        err,
        Error::RecordTooLarge { limit, .. } if limit == MAX_RECORD_LEN
    ));
    assert!(!err.is_retryable());
    assert!(server.get(&Key::from_u64(2)).unwrap().is_none());
    assert_eq!(server.last_record_lsn(), Lsn(1));

    // The position was not consumed
    server.ingest(record(3, 2)).unwrap();
    server.stop().unwrap();
    drop(server);

    let server = start(&dir);
    assert_eq!(server.last_record_lsn(), Lsn(2));
    assert_eq!(server.range(..).unwrap().len(), 2);
    assert_eq!(server.recovery_stats().truncated_bytes, 0);
}

// ============================================================================
// Checkpoints
// ============================================================================

#[test]
fn test_checkpoint_advances_watermark() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir);
    for lsn in 1..=5 {
        server.ingest(record(lsn, lsn)).unwrap();
    }
    assert!(server
        .wait_for_durable(Lsn(5), Duration::from_millis(10))
        .is_err());

    let outcome = server.checkpoint().unwrap();
    assert!(matches!(outcome, CheckpointOutcome::Published { entries: 5, .. }));
    assert_eq!(server.durable_watermark(), Lsn(5));
    server.wait_for_durable(Lsn(5), Duration::ZERO).unwrap();
    assert_eq!(server.live_layers().len(), 1);
    assert_eq!(server.checkpoint_counts(), (1, 0));
}

#[test]
fn test_back_to_back_checkpoints_idempotent() {
    let dir = TempDir::new().unwrap();
    let server = start(&dir);
    for lsn in 1..=20 {
        server.ingest(record(lsn % 7, lsn)).unwrap();
    }
    server.checkpoint().unwrap();
    let before = server.range(..).unwrap();

    assert_eq!(server.checkpoint().unwrap(), CheckpointOutcome::Empty);
    assert_eq!(server.range(..).unwrap(), before);
    assert_eq!(server.live_layers().len(), 1);
}

#[test]
fn test_wait_for_durable_wakes_on_checkpoint() {
    let dir = TempDir::new().unwrap();
    let server = Arc::new(start(&dir));
    server.ingest(record(1, 1)).unwrap();

    let waiter = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.wait_for_durable(Lsn(1), Duration::from_secs(10)))
    };
    thread::sleep(Duration::from_millis(20));
    server.checkpoint().unwrap();
    waiter.join().unwrap().unwrap();
}

#[test]
fn test_background_checkpoint_at_distance() {
    let dir = TempDir::new().unwrap();
    let config = PageServerConfig {
        checkpoint_distance: 50,
        ..PageServerConfig::for_testing()
    };
    let server = PageServer::start_with(dir.path(), config, None).unwrap();
    for lsn in 1..=50 {
        server.ingest(record(lsn, lsn)).unwrap();
    }
    server
        .wait_for_durable(Lsn(50), Duration::from_secs(10))
        .unwrap();
    assert_eq!(server.durable_watermark(), Lsn(50));
}

#[test]
fn test_ingest_continues_during_slow_sync() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(FailpointRegistry::new());
    registry
        .set_fault(
            CHECKPOINT_BEFORE_SYNC,
            FailAction::Sleep(Duration::from_millis(300)),
        )
        .unwrap();
    let server = Arc::new(
        PageServer::start_with(dir.path(), PageServerConfig::for_testing(), Some(registry))
            .unwrap(),
    );
    for lsn in 1..=10 {
        server.ingest(record(lsn, lsn)).unwrap();
    }

    let checkpointer = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.checkpoint())
    };
    thread::sleep(Duration::from_millis(50));

    // The checkpoint is asleep before its sync; ingestion and reads go on
    for lsn in 11..=20 {
        server.ingest(record(lsn, lsn)).unwrap();
    }
    assert_eq!(server.get(&Key::from_u64(5)).unwrap().unwrap().lsn, Lsn(5));
    assert_eq!(server.durable_watermark(), Lsn::INVALID);
    assert!(server.try_checkpoint().unwrap().is_none());

    checkpointer.join().unwrap().unwrap();
    assert_eq!(server.durable_watermark(), Lsn(10));
}

// ============================================================================
// Restart
// ============================================================================

#[test]
fn test_restart_recovers_layers_and_wal_tail() {
    let dir = TempDir::new().unwrap();
    {
        let server = start(&dir);
        for lsn in 1..=30 {
            server.ingest(record(lsn, lsn)).unwrap();
        }
        server.checkpoint().unwrap();
        for lsn in 31..=40 {
            server.ingest(record(lsn - 30, lsn)).unwrap();
        }
    }

    let server = start(&dir);
    let stats = server.recovery_stats();
    assert_eq!(stats.durable_watermark, Lsn(30));
    assert_eq!(stats.live_layers, 1);
    assert_eq!(stats.records_replayed, 10);
    assert_eq!(server.last_record_lsn(), Lsn(40));

    assert_eq!(server.get(&Key::from_u64(5)).unwrap().unwrap().lsn, Lsn(35));
    assert_eq!(server.get(&Key::from_u64(25)).unwrap().unwrap().lsn, Lsn(25));
    assert_eq!(server.range(..).unwrap().len(), 30);

    // New positions continue after the recovered ones
    assert!(server.ingest(record(1, 40)).is_err());
    server.ingest(record(1, 41)).unwrap();
}

#[test]
fn test_watermark_survives_restart_with_empty_wal_tail() {
    let dir = TempDir::new().unwrap();
    {
        let server = start(&dir);
        for lsn in 1..=10 {
            server.ingest(record(lsn, lsn)).unwrap();
        }
        server.checkpoint().unwrap();
    }

    let server = start(&dir);
    assert_eq!(server.durable_watermark(), Lsn(10));
    assert_eq!(server.last_record_lsn(), Lsn(10));
    assert!(server.ingest(record(1, 10)).is_err());
    server.ingest(record(1, 11)).unwrap();
}
