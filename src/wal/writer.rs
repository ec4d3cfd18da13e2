//! WAL Writer
//!
//! Handles appending entries to the active segment, rotating segments, and
//! forcing buffered bytes to stable storage.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;

use crate::error::{KeepError, Result};

use super::codec::EntryCodec;
use super::entry::{encode_frame, payload_limit, Operation, WalEntry};
use super::segment::SegmentManager;

/// Buffer capacity for the active segment writer
const WRITE_BUFFER_CAPACITY: usize = 64 * 1024;

/// Cumulative WAL counters, never reset
#[derive(Debug, Clone, Default)]
pub struct WalCounters {
    pub appends: u64,
    pub flushes: u64,
    pub rotations: u64,
    pub bytes_written: u64,
    pub discarded_entries: u64,
}

/// The segment currently receiving appends
struct ActiveSegment {
    id: u64,
    file: BufWriter<File>,
    /// Logical length including buffered bytes
    len: u64,
    /// Length confirmed by the last successful flush
    durable_len: u64,
    max_sequence: Option<u64>,
    durable_max_sequence: Option<u64>,
}

/// Writes entries to the WAL
///
/// Not internally synchronized: the coordinator's append path (or the async
/// worker that owns the writer) is the single serialization point.
pub struct WalWriter {
    segments: Arc<SegmentManager>,
    codec: Arc<dyn EntryCodec>,
    active: Option<ActiveSegment>,
    segment_size: u64,
    max_entry_size: u32,
    /// Highest sequence accepted into the buffer
    last_sequence: u64,
    /// Highest sequence confirmed on stable storage
    durable_sequence: u64,
    /// Bytes appended since the last flush
    buffered_bytes: usize,
    counters: WalCounters,
}

impl WalWriter {
    /// Open a writer on a fresh active segment
    ///
    /// `last_sequence` is the highest sequence already present in the log
    /// (or reflected in a snapshot); the first append gets `last_sequence + 1`.
    pub fn open(
        segments: Arc<SegmentManager>,
        codec: Arc<dyn EntryCodec>,
        segment_size: u64,
        max_entry_size: u32,
        last_sequence: u64,
    ) -> Result<Self> {
        let mut writer = Self {
            segments,
            codec,
            active: None,
            segment_size,
            max_entry_size,
            last_sequence,
            durable_sequence: last_sequence,
            buffered_bytes: 0,
            counters: WalCounters::default(),
        };
        writer.open_segment()?;

        tracing::info!(
            segment = writer.active_segment_id(),
            last_sequence,
            codec = writer.codec.name(),
            "Opened WAL writer"
        );
        Ok(writer)
    }

    /// Append an operation, assigning the next sequence number
    pub fn append(&mut self, operation: Operation) -> Result<u64> {
        let entry = WalEntry::new(self.last_sequence + 1, operation);
        self.append_entry(&entry)
    }

    /// Append an entry whose sequence was assigned by the caller
    ///
    /// The sequence must be greater than every sequence already appended.
    pub fn append_entry(&mut self, entry: &WalEntry) -> Result<u64> {
        if entry.sequence <= self.last_sequence {
            return Err(KeepError::WalWrite(format!(
                "sequence {} is not greater than last appended {}",
                entry.sequence, self.last_sequence
            )));
        }

        let data_len = entry.operation.data_len();
        if data_len > self.max_entry_size as usize {
            return Err(KeepError::WalWrite(format!(
                "entry of {} bytes exceeds max_entry_size_bytes {}",
                data_len, self.max_entry_size
            )));
        }

        let frame = encode_frame(entry, self.codec.as_ref())?;
        let payload_len = frame.len() - super::HEADER_SIZE;
        let limit = payload_limit(self.max_entry_size);
        if payload_len > limit as usize {
            return Err(KeepError::WalWrite(format!(
                "encoded entry of {} bytes exceeds frame limit {}",
                payload_len, limit
            )));
        }

        let frame_len = frame.len() as u64;
        if self.needs_rotation(frame_len) {
            self.rotate()?;
        }
        if self.active.is_none() {
            self.open_segment()?;
        }

        let write_result = match self.active.as_mut() {
            Some(active) => active.file.write_all(&frame),
            None => return Err(KeepError::WalWrite("no active segment".into())),
        };
        if let Err(e) = write_result {
            self.discard_unflushed();
            return Err(e.into());
        }

        if let Some(active) = self.active.as_mut() {
            active.len += frame_len;
            active.max_sequence = Some(entry.sequence);
        }
        self.last_sequence = entry.sequence;
        self.buffered_bytes += frame.len();
        self.counters.appends += 1;
        self.counters.bytes_written += frame_len;

        tracing::trace!(
            sequence = entry.sequence,
            kind = ?entry.operation.kind(),
            bytes = frame_len,
            "WAL append"
        );
        Ok(entry.sequence)
    }

    /// Force buffered bytes to stable storage
    ///
    /// Returns the highest durable sequence.
    pub fn flush(&mut self) -> Result<u64> {
        let Some(active) = self.active.as_mut() else {
            return Ok(self.durable_sequence);
        };
        if active.len == active.durable_len {
            return Ok(self.durable_sequence);
        }

        active.file.flush()?;
        active.file.get_ref().sync_data()?;

        active.durable_len = active.len;
        active.durable_max_sequence = active.max_sequence;
        self.durable_sequence = self.last_sequence;
        self.buffered_bytes = 0;
        self.counters.flushes += 1;

        self.segments
            .update_active(active.id, active.len, active.max_sequence);

        Ok(self.durable_sequence)
    }

    /// Drop everything appended since the last successful flush
    ///
    /// Truncates the active segment back to its durable length and rolls the
    /// sequence counter back, so an entry whose append was reported as failed
    /// can never reappear after a restart. If the truncation itself fails the
    /// segment is sealed at its durable length and a new one is opened on the
    /// next append.
    pub fn discard_unflushed(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let discarded = self.last_sequence - self.durable_sequence;
        self.counters.discarded_entries += discarded;
        self.last_sequence = self.durable_sequence;
        self.buffered_bytes = 0;

        let (file, _lost) = active.file.into_parts();
        let truncated = file
            .set_len(active.durable_len)
            .and_then(|_| file.sync_all());

        match truncated {
            Ok(()) => {
                tracing::warn!(
                    segment = active.id,
                    discarded,
                    durable_len = active.durable_len,
                    "Discarded unflushed WAL entries"
                );
                self.active = Some(ActiveSegment {
                    id: active.id,
                    file: BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file),
                    len: active.durable_len,
                    durable_len: active.durable_len,
                    max_sequence: active.durable_max_sequence,
                    durable_max_sequence: active.durable_max_sequence,
                });
            }
            Err(e) => {
                tracing::error!(
                    segment = active.id,
                    error = %e,
                    "Could not truncate WAL segment after failed write; sealing it"
                );
                self.segments
                    .seal(active.id, active.durable_len, active.durable_max_sequence);
            }
        }
    }

    /// Seal the active segment and open the next one
    pub fn rotate(&mut self) -> Result<()> {
        self.flush()?;
        if let Some(active) = self.active.take() {
            self.segments.seal(active.id, active.len, active.max_sequence);
        }
        self.counters.rotations += 1;
        self.open_segment()
    }

    /// Flush and release the active segment handle
    pub fn close(mut self) -> Result<u64> {
        let durable = self.flush()?;
        if let Some(active) = self.active.take() {
            self.segments.seal(active.id, active.len, active.max_sequence);
        }
        Ok(durable)
    }

    fn needs_rotation(&self, frame_len: u64) -> bool {
        match &self.active {
            // An oversized entry still goes into an empty segment on its own
            Some(active) => active.len > 0 && active.len + frame_len > self.segment_size,
            None => false,
        }
    }

    fn open_segment(&mut self) -> Result<()> {
        let (id, file) = self.segments.create_segment()?;
        self.active = Some(ActiveSegment {
            id,
            file: BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file),
            len: 0,
            durable_len: 0,
            max_sequence: None,
            durable_max_sequence: None,
        });
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Highest sequence accepted into the buffer
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Highest sequence confirmed durable
    pub fn durable_sequence(&self) -> u64 {
        self.durable_sequence
    }

    /// Bytes appended since the last flush
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn active_segment_id(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.id)
    }

    pub fn counters(&self) -> &WalCounters {
        &self.counters
    }

    pub fn segments(&self) -> &Arc<SegmentManager> {
        &self.segments
    }
}
