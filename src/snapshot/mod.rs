//! Snapshot Module
//!
//! Point-in-time dumps of the whole cache, tagged with the WAL watermark.
//!
//! ## Responsibilities
//! - Write a consistent dump from a stable cache view (`writer`)
//! - Verify the trailer checksum before trusting a payload (`reader`)
//! - Keep the newest N verified snapshots (`retention`)
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (7 bytes)                                        │
//! │   Magic: "CKSN" (4) | Version: u16 (2) | Flags: u8 (1)  │
//! ├─────────────────────────────────────────────────────────┤
//! │ Payload (variable, zstd stream when flags & 1)          │
//! │   [KeyLen: u32][Key][ValLen: u32][Value]                │
//! │   [HasExpiry: u8][ExpiresAt: i64 if HasExpiry]          │
//! │   ... repeated for each entry ...                       │
//! ├─────────────────────────────────────────────────────────┤
//! │ Trailer (32 bytes)                                      │
//! │   Timestamp: i64 | EntryCount: u64 | Watermark: u64     │
//! │   CRC32: u32 | Magic: "CKSE" (4)                        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//! CRC32 covers everything before the CRC field. Files are named
//! `snapshot-<timestamp>-<watermark>.snap` and written via a temp file,
//! fsync and atomic rename.

mod reader;
mod retention;
mod writer;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

pub use reader::SnapshotReader;
pub use retention::SnapshotRetention;
pub use writer::SnapshotWriter;

use crate::cache::CacheRecord;
use crate::error::{KeepError, Result};

// =============================================================================
// Shared Constants (used by writer and reader)
// =============================================================================

/// Magic bytes opening a snapshot file
pub(crate) const MAGIC: &[u8; 4] = b"CKSN";

/// Magic bytes closing a snapshot file
pub(crate) const TRAILER_MAGIC: &[u8; 4] = b"CKSE";

/// Current snapshot format version
pub(crate) const VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) + Flags (1) = 7 bytes
pub(crate) const HEADER_SIZE: u64 = 7;

/// Trailer size: Timestamp (8) + Count (8) + Watermark (8) + CRC (4) + Magic (4)
pub(crate) const TRAILER_SIZE: u64 = 32;

/// Flag bit: payload is a zstd stream
pub(crate) const FLAG_ZSTD: u8 = 0b0000_0001;

/// zstd level used for compressed payloads
pub(crate) const ZSTD_LEVEL: i32 = 3;

const FILE_PREFIX: &str = "snapshot-";
const FILE_EXTENSION: &str = "snap";
const TEMP_PREFIX: &str = ".snapshot-";
const TEMP_SUFFIX: &str = ".tmp";

// =============================================================================
// Snapshot Metadata
// =============================================================================

/// Metadata of a snapshot, as stored in its trailer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub path: PathBuf,

    /// Creation time (unix millis)
    pub timestamp: i64,

    /// Highest WAL sequence reflected in the snapshot
    pub watermark: u64,

    pub entry_count: u64,
    pub checksum: u32,
    pub compressed: bool,
    pub size_bytes: u64,
}

/// A snapshot file discovered by name, not yet opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub timestamp: i64,
    pub watermark: u64,
}

/// "snapshot-1700000000000-42.snap"
pub fn snapshot_file_name(timestamp: i64, watermark: u64) -> String {
    format!("{}{}-{}.{}", FILE_PREFIX, timestamp, watermark, FILE_EXTENSION)
}

pub(crate) fn temp_file_name(timestamp: i64, watermark: u64) -> String {
    format!("{}{}-{}{}", TEMP_PREFIX, timestamp, watermark, TEMP_SUFFIX)
}

/// Parse (timestamp, watermark) from a snapshot filename
pub fn parse_snapshot_name(path: &Path) -> Option<(i64, u64)> {
    if path.extension()?.to_str()? != FILE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let rest = stem.strip_prefix(FILE_PREFIX)?;
    let (timestamp, watermark) = rest.split_once('-')?;
    Some((timestamp.parse().ok()?, watermark.parse().ok()?))
}

/// List snapshot files, oldest first (by watermark, then timestamp)
pub fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut snapshots = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some((timestamp, watermark)) = parse_snapshot_name(&path) {
            snapshots.push(SnapshotFile {
                path,
                timestamp,
                watermark,
            });
        }
    }

    snapshots.sort_by_key(|s| (s.watermark, s.timestamp));
    Ok(snapshots)
}

/// Remove temp files left behind by an interrupted snapshot
pub fn cleanup_temp_files(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "Removed incomplete snapshot files");
    }
    Ok(removed)
}

// =============================================================================
// Snapshot Store
// =============================================================================

/// Writes, verifies and prunes snapshots in one directory
pub struct SnapshotStore {
    dir: PathBuf,
    writer: SnapshotWriter,
    retention: SnapshotRetention,
}

impl SnapshotStore {
    pub fn open(dir: &Path, compression: bool, retention_count: usize) -> Result<Self> {
        fs::create_dir_all(dir)?;
        cleanup_temp_files(dir)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            writer: SnapshotWriter::new(dir, compression),
            retention: SnapshotRetention::new(retention_count),
        })
    }

    /// Write a snapshot, verify it loads, then apply retention
    ///
    /// A snapshot that fails verification is deleted and reported as
    /// corruption; older snapshots are left untouched in that case.
    pub fn create<I>(&self, records: I, watermark: u64, cancel: &AtomicBool) -> Result<SnapshotMeta>
    where
        I: Iterator<Item = CacheRecord>,
    {
        let written = self.writer.write(records, watermark, cancel)?;

        let verified = match SnapshotReader::verify(&written.path) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::error!(
                    path = %written.path.display(),
                    error = %e,
                    "New snapshot failed verification; discarding it"
                );
                let _ = fs::remove_file(&written.path);
                return Err(KeepError::SnapshotCorruption(format!(
                    "freshly written snapshot failed verification: {}",
                    e
                )));
            }
        };

        let pruned = self.retention.prune(&self.dir, &verified)?;
        if !pruned.is_empty() {
            tracing::debug!(pruned = pruned.len(), "Applied snapshot retention");
        }

        Ok(verified)
    }

    /// Snapshots on disk, newest first
    pub fn newest_first(&self) -> Result<Vec<SnapshotFile>> {
        let mut all = list_snapshots(&self.dir)?;
        all.reverse();
        Ok(all)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
