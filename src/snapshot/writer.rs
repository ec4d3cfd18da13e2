//! Snapshot Writer
//!
//! Streams a stable cache view into a snapshot file.
//!
//! ## Write Protocol
//! 1. Write header, records and trailer into `.snapshot-<ts>-<wm>.tmp`
//! 2. fsync the temp file
//! 3. Rename to `snapshot-<ts>-<wm>.snap`
//! 4. fsync the directory
//!
//! A crash anywhere before step 3 leaves only a temp file, which is removed
//! on the next startup. The cancel flag is polled while records stream; an
//! aborted write removes its temp file and never becomes visible.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crc32fast::Hasher;

use crate::cache::CacheRecord;
use crate::error::{KeepError, Result};
use crate::wal::{now_millis, sync_dir};

use super::{
    snapshot_file_name, temp_file_name, SnapshotMeta, FLAG_ZSTD, MAGIC, TRAILER_MAGIC, VERSION,
    ZSTD_LEVEL,
};

/// Records written between two checks of the cancel flag
const CANCEL_CHECK_INTERVAL: u64 = 1024;

const WRITE_BUFFER_CAPACITY: usize = 256 * 1024;

/// Writes snapshot files into one directory
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
    compression: bool,
}

impl SnapshotWriter {
    pub fn new(dir: &Path, compression: bool) -> Self {
        Self {
            dir: dir.to_path_buf(),
            compression,
        }
    }

    /// Write every record into a new snapshot tagged with `watermark`
    ///
    /// The returned metadata describes the renamed, durable file.
    pub fn write<I>(&self, records: I, watermark: u64, cancel: &AtomicBool) -> Result<SnapshotMeta>
    where
        I: Iterator<Item = CacheRecord>,
    {
        let timestamp = now_millis();
        let temp_path = self.dir.join(temp_file_name(timestamp, watermark));
        let final_path = self.dir.join(snapshot_file_name(timestamp, watermark));

        let started = std::time::Instant::now();
        let written = match self.write_temp(&temp_path, records, timestamp, watermark, cancel) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        let renamed = fs::rename(&temp_path, &final_path)
            .map_err(KeepError::from)
            .and_then(|_| sync_dir(&self.dir));
        if let Err(e) = renamed {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        tracing::info!(
            path = %final_path.display(),
            watermark,
            entries = written.entry_count,
            bytes = written.size_bytes,
            compressed = self.compression,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot written"
        );

        Ok(SnapshotMeta {
            path: final_path,
            timestamp,
            watermark,
            entry_count: written.entry_count,
            checksum: written.checksum,
            compressed: self.compression,
            size_bytes: written.size_bytes,
        })
    }

    fn write_temp<I>(
        &self,
        path: &Path,
        records: I,
        timestamp: i64,
        watermark: u64,
        cancel: &AtomicBool,
    ) -> Result<Written>
    where
        I: Iterator<Item = CacheRecord>,
    {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut out = ChecksumWriter::new(BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file));

        // ---------------------------------------------------------------------
        // Header
        // ---------------------------------------------------------------------
        let flags = if self.compression { FLAG_ZSTD } else { 0 };
        out.write_all(MAGIC)?;
        out.write_all(&VERSION.to_le_bytes())?;
        out.write_all(&[flags])?;

        // ---------------------------------------------------------------------
        // Payload
        // ---------------------------------------------------------------------
        let entry_count = if self.compression {
            let mut encoder = zstd::stream::write::Encoder::new(&mut out, ZSTD_LEVEL)?;
            let count = write_records(&mut encoder, records, cancel)?;
            encoder.finish()?;
            count
        } else {
            write_records(&mut out, records, cancel)?
        };

        // ---------------------------------------------------------------------
        // Trailer
        // ---------------------------------------------------------------------
        out.write_all(&timestamp.to_le_bytes())?;
        out.write_all(&entry_count.to_le_bytes())?;
        out.write_all(&watermark.to_le_bytes())?;

        let (mut inner, checksum, hashed) = out.finish();
        inner.write_all(&checksum.to_le_bytes())?;
        inner.write_all(TRAILER_MAGIC)?;

        let file = inner
            .into_inner()
            .map_err(|e| KeepError::Io(e.into_error()))?;
        file.sync_all()?;

        Ok(Written {
            entry_count,
            checksum,
            size_bytes: hashed + 8,
        })
    }
}

struct Written {
    entry_count: u64,
    checksum: u32,
    size_bytes: u64,
}

/// Encode records until the iterator ends or the cancel flag is raised
fn write_records<W, I>(out: &mut W, records: I, cancel: &AtomicBool) -> Result<u64>
where
    W: Write,
    I: Iterator<Item = CacheRecord>,
{
    let mut count: u64 = 0;
    for record in records {
        if count % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(KeepError::SnapshotAborted(format!(
                "cancelled after {} records",
                count
            )));
        }
        write_record(out, &record)?;
        count += 1;
    }

    if cancel.load(Ordering::Relaxed) {
        return Err(KeepError::SnapshotAborted(format!(
            "cancelled after {} records",
            count
        )));
    }
    Ok(count)
}

/// [KeyLen: u32][Key][ValLen: u32][Value][HasExpiry: u8][ExpiresAt: i64?]
pub(crate) fn write_record<W: Write>(out: &mut W, record: &CacheRecord) -> Result<()> {
    let key_len = u32::try_from(record.key.len())
        .map_err(|_| KeepError::Encode("key longer than 4 GiB".into()))?;
    let value_len = u32::try_from(record.value.len())
        .map_err(|_| KeepError::Encode("value longer than 4 GiB".into()))?;

    out.write_all(&key_len.to_le_bytes())?;
    out.write_all(&record.key)?;
    out.write_all(&value_len.to_le_bytes())?;
    out.write_all(&record.value)?;
    match record.expires_at {
        Some(at) => {
            out.write_all(&[1])?;
            out.write_all(&at.to_le_bytes())?;
        }
        None => out.write_all(&[0])?,
    }
    Ok(())
}

// =============================================================================
// Checksumming Writer
// =============================================================================

/// Feeds every byte written through it into a CRC32 hasher
struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            written: 0,
        }
    }

    /// Returns (inner writer, checksum, bytes hashed)
    fn finish(self) -> (W, u32, u64) {
        (self.inner, self.hasher.finalize(), self.written)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
