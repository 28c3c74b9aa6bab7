//! Damaged durable state
//!
//! MANIFEST damage or loss is fatal and never repaired. A damaged live layer file
//! is reported as corruption.

use crate::common::*;

fn checkpointed_server() -> TestServer {
    let mut test = TestServer::new();
    test.ingest_keys(0..40);
    test.server().checkpoint().unwrap();
    test.shutdown();
    test
}

#[test]
fn test_manifest_bit_flip_is_fatal() {
    let test = checkpointed_server();
    let manifest = test.manifest_path();
    flip_byte(&manifest, 20);
    let damaged = std::fs::read(&manifest).unwrap();

    let err = test.try_start().err().expect("start should fail");
    assert!(matches!(err, Error::ManifestCorrupted(_)), "got {:?}", err);
    assert!(err.is_fatal());

    // Not repaired, not replaced
    assert_eq!(std::fs::read(&manifest).unwrap(), damaged);
    assert!(test.try_start().is_err());
}

#[test]
fn test_truncated_manifest_is_fatal() {
    let test = checkpointed_server();
    let manifest = test.manifest_path();
    let bytes = std::fs::read(&manifest).unwrap();
    std::fs::write(&manifest, &bytes[..bytes.len() / 2]).unwrap();

    let err = test.try_start().err().expect("start should fail");
    assert!(err.is_fatal());
}

#[test]
fn test_damaged_live_layer_is_reported() {
    let test = checkpointed_server();
    let layers = files_with_suffix(&test.layers_dir(), ".lyr");
    assert_eq!(layers.len(), 1);
    let len = std::fs::metadata(&layers[0]).unwrap().len() as usize;
    flip_byte(&layers[0], len / 2);

    let err = test.try_start().err().expect("start should fail");
    assert!(matches!(err, Error::Corruption(_)), "got {:?}", err);
}

#[test]
fn test_missing_live_layer_is_reported() {
    let test = checkpointed_server();
    for layer in files_with_suffix(&test.layers_dir(), ".lyr") {
        std::fs::remove_file(layer).unwrap();
    }
    assert!(test.try_start().is_err());
}

#[test]
fn test_missing_manifest_after_checkpoint_is_fatal() {
    let test = checkpointed_server();
    let layers = files_with_suffix(&test.layers_dir(), ".lyr");
    assert_eq!(layers.len(), 1);
    let layer_bytes = std::fs::read(&layers[0]).unwrap();

    std::fs::remove_file(test.manifest_path()).unwrap();
    for segment in files_with_suffix(&test.wal_dir(), ".seg") {
        std::fs::remove_file(segment).unwrap();
    }

    let err = test.try_start().err().expect("start should fail");
    assert!(matches!(err, Error::ManifestCorrupted(_)), "got {:?}", err);
    assert!(err.is_fatal());

    // The published layer is kept for the operator and no MANIFEST appears
    assert_eq!(std::fs::read(&layers[0]).unwrap(), layer_bytes);
    assert!(!test.manifest_path().exists());
    assert!(test.try_start().is_err());
}
