//! Real process abort in the after-sync crash window
//!
//! The parent re-runs this test binary with only `crash_child` selected and
//! the data directory in an environment variable. The child:
//!
//! 1. ingests KEYS increasing keys and checkpoints them
//! 2. arms `checkpoint-before-sync=sleep(2000);checkpoint-after-sync=panic`
//! 3. overwrites one key continuously while a checkpoint runs, sleeps
//!    before its sync, syncs and aborts the process
//!
//! The parent then restarts the server and checks that every key is there
//! exactly once and that the watermark the child reported is kept.

use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::common::*;

const CHILD_DIR_ENV: &str = "PAGESTORE_CRASH_CHILD_DIR";
const KEYS: u64 = 100_000;
const HOT_KEY: u64 = 0;
const FAULTS: &str = "checkpoint-before-sync=sleep(2000);checkpoint-after-sync=panic";

fn child_config() -> PageServerConfig {
    PageServerConfig {
        durability: "standard".to_string(),
        wal_flush_interval_ms: 10,
        checkpoint_distance: 0,
        checkpoint_interval_ms: 0,
        ..PageServerConfig::default()
    }
}

/// Report a line to the parent and flush before a possible abort
fn report(line: &str) {
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

fn reported_value(stdout: &str, name: &str) -> Option<u64> {
    let prefix = format!("{}=", name);
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix(prefix.as_str()))
        .and_then(|value| value.parse().ok())
}

fn run_child(dir: &Path) {
    let registry = Arc::new(FailpointRegistry::new());
    let server = Arc::new(
        PageServer::start_with(dir, child_config(), Some(Arc::clone(&registry))).unwrap(),
    );

    for key in 0..KEYS {
        server.ingest(record(key, key + 1)).unwrap();
    }
    server.checkpoint().unwrap();
    server
        .wait_for_durable(Lsn(KEYS), Duration::from_secs(30))
        .unwrap();
    report(&format!("DURABLE={}", server.durable_watermark().as_u64()));

    registry.configure(FAULTS).unwrap();
    report("ARMED=1");

    let mut lsn = KEYS;
    for _ in 0..100 {
        lsn += 1;
        server.ingest(record(HOT_KEY, lsn)).unwrap();
    }
    report(&format!("FROZEN_AT_LEAST={}", lsn));

    // Sleeps 2s before its sync, then aborts after it
    let checkpointer = {
        let server = Arc::clone(&server);
        thread::spawn(move || server.checkpoint())
    };

    let deadline = Instant::now() + Duration::from_secs(60);
    while Instant::now() < deadline {
        lsn += 1;
        server.ingest(record(HOT_KEY, lsn)).unwrap();
        if lsn % 100 == 0 {
            report(&format!("ACCEPTED={}", lsn));
        }
        thread::sleep(Duration::from_millis(1));
    }

    // Reaching this point means the abort never fired
    let _ = checkpointer.join();
    report("NO_ABORT=1");
}

/// Child half of `test_abort_after_sync_loses_nothing`. Does nothing unless
/// launched by the parent.
#[test]
#[ignore]
fn crash_child() {
    if let Ok(dir) = std::env::var(CHILD_DIR_ENV) {
        run_child(Path::new(&dir));
    }
}

#[test]
fn test_abort_after_sync_loses_nothing() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();

    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args([
            "process_abort::crash_child",
            "--exact",
            "--ignored",
            "--nocapture",
            "-q",
            "--test-threads=1",
        ])
        .env(CHILD_DIR_ENV, dir.path())
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(
        !output.status.success(),
        "child should have aborted, stdout:\n{}",
        stdout
    );
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(6), "child was not aborted");
    }
    assert_eq!(reported_value(&stdout, "ARMED"), Some(1));
    assert_eq!(reported_value(&stdout, "NO_ABORT"), None);
    let durable_before = reported_value(&stdout, "DURABLE").unwrap();
    let frozen_at_least = reported_value(&stdout, "FROZEN_AT_LEAST").unwrap();
    assert_eq!(durable_before, KEYS);

    // The synced but unpublished layer is still on disk
    let layer_files = files_with_suffix(&dir.path().join("layers"), ".lyr");
    assert_eq!(layer_files.len(), 2);

    let server =
        PageServer::start_with(dir.path(), PageServerConfig::for_testing(), None).unwrap();
    let stats = server.recovery_stats().clone();
    assert_eq!(stats.orphans_removed, 1);
    assert_eq!(stats.live_layers, 1);
    assert!(server.durable_watermark() >= Lsn(durable_before));
    assert_eq!(files_with_suffix(&dir.path().join("layers"), ".lyr").len(), 1);

    // Every original key, each exactly once, in key order
    let all = server.range(..).unwrap();
    assert_eq!(all.len() as u64, KEYS);
    for (expected_key, found) in (0..KEYS).zip(all.iter()) {
        assert_eq!(found.key, Key::from_u64(expected_key));
        if expected_key != HOT_KEY {
            assert_eq!(found.lsn, Lsn(expected_key + 1));
            assert_eq!(found.payload, payload(expected_key, expected_key + 1));
        }
    }

    // The hot key carries its latest overwrite, at least the ones frozen
    // into the aborted checkpoint
    let hot = server.get(&Key::from_u64(HOT_KEY)).unwrap().unwrap();
    assert!(hot.lsn >= Lsn(frozen_at_least));
    assert_eq!(hot.lsn, server.last_record_lsn());
    assert_eq!(hot.payload, payload(HOT_KEY, hot.lsn.as_u64()));

    // Serving again: a checkpoint now publishes what the aborted one could not
    let next = server.last_record_lsn().as_u64() + 1;
    server.ingest(record(HOT_KEY, next)).unwrap();
    assert!(matches!(
        server.checkpoint().unwrap(),
        CheckpointOutcome::Published { .. }
    ));
    assert_eq!(server.durable_watermark(), Lsn(next));
}
