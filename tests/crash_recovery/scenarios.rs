//! Restart scenarios run in-process
//!
//! A restart here is stop + start over the same directory. What the
//! process-abort test leaves on disk (an orphan layer, a torn WAL tail) is
//! reproduced by hand where needed.

use std::collections::BTreeMap;

use crate::common::*;

/// Latest lsn per key, from the server's point of view
fn snapshot(server: &PageServer) -> BTreeMap<Key, Lsn> {
    server
        .range(..)
        .unwrap()
        .into_iter()
        .map(|r| (r.key, r.lsn))
        .collect()
}

// ============================================================================
// Replay
// ============================================================================

#[test]
fn test_zero_layers_full_replay() {
    let mut test = TestServer::new();
    test.ingest_keys(0..1000);
    let before = snapshot(test.server());

    test.restart();
    let server = test.server();
    assert!(server.live_layers().is_empty());
    assert_eq!(server.durable_watermark(), Lsn::INVALID);
    assert_eq!(server.recovery_stats().records_replayed, 1000);
    assert_eq!(snapshot(server), before);
    assert_eq!(server.last_record_lsn(), Lsn(1000));
}

#[test]
fn test_disjoint_checkpoints_merge_after_restart() {
    let mut test = TestServer::new();
    test.ingest_keys(0..100);
    test.server().checkpoint().unwrap();
    // Second set is disjoint except for key 7, rewritten later
    test.ingest_keys(100..200);
    let rewrite = test.ingest_keys([7]);
    test.server().checkpoint().unwrap();

    test.restart();
    let server = test.server();
    assert_eq!(server.live_layers().len(), 2);
    assert_eq!(server.recovery_stats().records_replayed, 0);

    let state = snapshot(server);
    assert_eq!(state.len(), 200);
    assert_eq!(state[&Key::from_u64(7)], rewrite);
    assert_eq!(state[&Key::from_u64(8)], Lsn(9));
    assert_eq!(state[&Key::from_u64(150)], Lsn(151));
    let hot = server.get(&Key::from_u64(7)).unwrap().unwrap();
    assert_eq!(hot.payload, payload(7, rewrite.as_u64()));
}

#[test]
fn test_back_to_back_checkpoints_match_single() {
    let mut once = TestServer::new();
    let mut twice = TestServer::new();
    for test in [&once, &twice] {
        test.ingest_keys((0..300).map(|i| i % 40));
        test.server().checkpoint().unwrap();
    }
    assert_eq!(twice.server().checkpoint().unwrap(), CheckpointOutcome::Empty);

    once.restart();
    twice.restart();
    assert_eq!(snapshot(once.server()), snapshot(twice.server()));
    assert_eq!(
        once.server().live_layers().len(),
        twice.server().live_layers().len()
    );
}

#[test]
fn test_watermark_never_decreases_across_restarts() {
    let mut test = TestServer::new();
    let mut last = Lsn::INVALID;
    for round in 0..5u64 {
        test.ingest_keys(round * 10..round * 10 + 10);
        if round % 2 == 0 {
            test.server().checkpoint().unwrap();
        }
        test.restart();
        let watermark = test.server().durable_watermark();
        assert!(watermark >= last, "watermark went from {} to {}", last, watermark);
        last = watermark;
    }
    assert_eq!(last, Lsn(50));
    assert_eq!(test.server().range(..).unwrap().len(), 50);
}

#[test]
fn test_compacted_wal_restart() {
    let mut test = TestServer::new();
    // for_testing segments are 64 KiB; big payloads force rotations
    let server = test.server();
    for lsn in 1..=200u64 {
        server
            .ingest(MutationRecord::new(Key::from_u64(lsn % 20), vec![lsn as u8; 2048], lsn))
            .unwrap();
    }
    let outcome = server.checkpoint().unwrap();
    let CheckpointOutcome::Published {
        wal_segments_removed,
        ..
    } = outcome
    else {
        panic!("expected a published layer");
    };
    assert!(wal_segments_removed > 0);
    let before = snapshot(server);

    test.restart();
    assert_eq!(snapshot(test.server()), before);
    assert_eq!(test.server().durable_watermark(), Lsn(200));
}

// ============================================================================
// Checkpoint failures
// ============================================================================

#[test]
fn test_return_error_is_retryable() {
    let (mut test, registry) = TestServer::with_failpoints();
    test.ingest_keys(0..50);
    registry
        .set_fault(CHECKPOINT_BEFORE_SYNC, FailAction::ReturnError)
        .unwrap();

    let err = test.server().checkpoint().unwrap_err();
    assert!(matches!(err, Error::CheckpointFailed(_)));
    assert!(err.is_retryable());
    assert_eq!(test.server().durable_watermark(), Lsn::INVALID);
    assert_eq!(test.server().range(..).unwrap().len(), 50);
    assert_eq!(registry.hits(CHECKPOINT_BEFORE_SYNC), 1);

    // Still failing after a restart; the WAL has everything
    test.restart();
    assert_eq!(test.server().range(..).unwrap().len(), 50);
    assert!(test.server().checkpoint().is_err());

    registry.clear_faults();
    assert!(matches!(
        test.server().checkpoint().unwrap(),
        CheckpointOutcome::Published { .. }
    ));
    assert_eq!(test.server().durable_watermark(), Lsn(50));
    assert!(files_with_suffix(&test.layers_dir(), ".lyr").len() == 1);
}

#[test]
fn test_after_sync_error_leaves_no_published_layer() {
    let (mut test, registry) = TestServer::with_failpoints();
    test.ingest_keys(0..10);
    registry.configure("checkpoint-after-sync=return").unwrap();
    assert!(test.server().checkpoint().is_err());

    registry.clear_faults();
    test.restart();
    let server = test.server();
    assert!(server.live_layers().is_empty());
    assert_eq!(server.recovery_stats().orphans_removed, 0);
    assert_eq!(server.range(..).unwrap().len(), 10);
}

// ============================================================================
// Leftovers on disk
// ============================================================================

#[test]
fn test_orphan_layer_does_not_change_results() {
    let mut test = TestServer::new();
    test.ingest_keys(0..20);
    test.server().checkpoint().unwrap();
    test.ingest_keys(0..5);
    let before = snapshot(test.server());
    test.shutdown();

    // A synced but unpublished layer, as an abort after sync leaves it
    let live = files_with_suffix(&test.layers_dir(), ".lyr");
    assert_eq!(live.len(), 1);
    let orphan = test.layers_dir().join("layer-000777.lyr");
    std::fs::copy(&live[0], &orphan).unwrap();

    test.start();
    assert_eq!(test.server().recovery_stats().orphans_removed, 1);
    assert!(!orphan.exists());
    assert_eq!(snapshot(test.server()), before);
}

#[test]
fn test_stale_manifest_temp_removed() {
    let mut test = TestServer::new();
    test.ingest_keys(0..5);
    test.server().checkpoint().unwrap();
    test.shutdown();

    let temp = test.manifest_path().with_extension("tmp");
    std::fs::write(&temp, b"half written").unwrap();

    test.start();
    assert!(!temp.exists());
    assert_eq!(test.server().durable_watermark(), Lsn(5));
}

#[test]
fn test_corrupt_wal_record_ends_recovered_history() {
    let mut test = TestServer::new();
    test.ingest_keys([1, 1, 2]);
    test.shutdown();

    // Damage the overwrite of key 1; the later write of key 2 must not
    // survive without it
    let segments = files_with_suffix(&test.wal_dir(), ".seg");
    let last = segments.last().unwrap();
    let bytes = std::fs::read(last).unwrap();
    let needle = payload(1, 2);
    let at = bytes
        .windows(needle.len())
        .position(|w| w == needle.as_slice())
        .unwrap();
    flip_byte(last, at);

    test.start();
    let server = test.server();
    assert_eq!(server.get(&Key::from_u64(1)).unwrap().unwrap().lsn, Lsn(1));
    assert!(server.get(&Key::from_u64(2)).unwrap().is_none());
    assert_eq!(server.last_record_lsn(), Lsn(1));
    assert!(server.recovery_stats().truncated_bytes > 0);

    // Positions after the cut are accepted again
    test.ingest_keys([2]);
    test.restart();
    assert_eq!(test.server().last_record_lsn(), Lsn(2));
}

#[test]
fn test_torn_wal_tail_truncated() {
    let mut test = TestServer::new();
    test.ingest_keys(0..30);
    let before = snapshot(test.server());
    test.shutdown();

    let segments = files_with_suffix(&test.wal_dir(), ".seg");
    let last = segments.last().unwrap();
    // Length prefix promising more bytes than follow
    append_bytes(last, &[0x40, 0x00, 0x00, 0x00, 0x01, 0x02]);

    test.start();
    assert!(test.server().recovery_stats().truncated_bytes > 0);
    assert_eq!(snapshot(test.server()), before);

    // Appends after the truncation are readable on the next restart
    test.ingest_keys([99]);
    test.restart();
    assert_eq!(test.server().range(..).unwrap().len(), 31);
}
