//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only, segmented logging.
//!
//! ## Responsibilities
//! - Append log entries before (or alongside) every cache mutation
//! - CRC32 checksums for corruption detection
//! - Strictly increasing sequence numbers across segments
//! - Size-bounded segments with rotation, sealing and safe deletion
//!
//! ## Frame Format
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Entry 1                                      │
//! │ ┌──────────┬─────────┬─────────┬──────────┐  │
//! │ │ Seq (8)  │ CRC (4) │ Len (4) │ Payload  │  │
//! │ └──────────┴─────────┴─────────┴──────────┘  │
//! ├──────────────────────────────────────────────┤
//! │ Entry 2                                      │
//! │ ┌──────────┬─────────┬─────────┬──────────┐  │
//! │ │ Seq (8)  │ CRC (4) │ Len (4) │ Payload  │  │
//! │ └──────────┴─────────┴─────────┴──────────┘  │
//! └──────────────────────────────────────────────┘
//! ```
//! CRC covers Seq ‖ Len ‖ Payload. Segments are named `wal-<id>.log`.

mod codec;
mod entry;
mod reader;
mod segment;
mod writer;

pub use codec::{BincodeCodec, EntryCodec};
pub use entry::{
    decode_frame, encode_frame, frame_checksum, now_millis, payload_limit, FrameHeader, OpKind,
    Operation, WalEntry, HEADER_SIZE, PAYLOAD_OVERHEAD,
};
pub use reader::{CorruptionPoint, SegmentIterator, SegmentReader, WalReader};
pub use segment::{
    parse_segment_id, segment_file_name, segment_path, ReadLease, SegmentInfo, SegmentManager,
};
pub(crate) use segment::sync_dir;
pub use writer::{WalCounters, WalWriter};
