//! On-disk formats
//!
//! - `wal_record`: WAL segment header and record framing
//! - `layer`: immutable layer files
//! - `manifest`: the MANIFEST (live layers + durable watermark)
//!
//! All integers are little-endian; every file carries a CRC32.

pub mod layer;
pub mod manifest;
pub mod wal_record;

pub use layer::{
    decode_layer, layer_path, parse_layer_name, read_layer_file, write_layer_file,
    LayerFileError, LayerFileHeader, LAYER_FORMAT_VERSION, LAYER_HEADER_SIZE, LAYER_MAGIC,
};
pub use manifest::{
    Manifest, ManifestError, ManifestLayer, ManifestManager, MANIFEST_FORMAT_VERSION,
    MANIFEST_MAGIC,
};
pub use wal_record::{
    SegmentHeader, WalRecord, WalRecordError, WalSegment, MAX_RECORD_LEN, SEGMENT_FORMAT_VERSION,
    SEGMENT_HEADER_SIZE, SEGMENT_MAGIC, WAL_RECORD_FORMAT_VERSION,
};
