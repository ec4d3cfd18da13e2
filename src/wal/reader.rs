//! WAL Reader
//!
//! Handles reading entries from WAL segments.
//!
//! Reading is strict: the first frame that is truncated, fails its checksum,
//! cannot be decoded, or carries a non-increasing sequence ends the scan. The
//! reader remembers where that happened so recovery can report it and cut the
//! log at the last trusted byte.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use crate::error::{KeepError, Result};

use super::codec::{BincodeCodec, EntryCodec};
use super::entry::{decode_payload, payload_limit, FrameHeader, HEADER_SIZE};
use super::segment::SegmentInfo;
use super::WalEntry;

/// Where and why a scan stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionPoint {
    /// Segment containing the bad frame
    pub segment_id: u64,

    /// Byte offset of the bad frame (= length of the trusted prefix)
    pub offset: u64,

    /// Human-readable reason
    pub reason: String,
}

// =============================================================================
// Single Segment
// =============================================================================

/// Reads frames from one segment file
pub struct SegmentReader {
    segment_id: u64,
    reader: BufReader<File>,
    /// End of the last frame read successfully
    offset: u64,
    file_len: u64,
    codec: Arc<dyn EntryCodec>,
    max_entry_size: u32,
}

impl SegmentReader {
    /// Open a segment file for reading with the default codec
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, 0, Arc::new(BincodeCodec), u32::MAX)
    }

    pub fn open_with(
        path: &Path,
        segment_id: u64,
        codec: Arc<dyn EntryCodec>,
        max_entry_size: u32,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();

        Ok(Self {
            segment_id,
            reader: BufReader::new(file),
            offset: 0,
            file_len,
            codec,
            max_entry_size,
        })
    }

    /// Read the next entry from the segment
    ///
    /// Returns:
    /// - `Ok(Some(entry))`: a complete, verified frame
    /// - `Ok(None)`: clean end of file
    /// - `Err(WalCorruption)`: torn or corrupted frame at `offset()`
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        let remaining = self.file_len.saturating_sub(self.offset);
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < HEADER_SIZE as u64 {
            return Err(KeepError::WalCorruption(format!(
                "truncated header: {} trailing bytes",
                remaining
            )));
        }

        let mut raw = [0u8; HEADER_SIZE];
        read_exact_or_torn(&mut self.reader, &mut raw)?;
        let header = FrameHeader::parse(&raw);

        let limit = payload_limit(self.max_entry_size);
        if header.payload_len > limit {
            return Err(KeepError::WalCorruption(format!(
                "frame length {} exceeds limit {}",
                header.payload_len, limit
            )));
        }
        if (header.frame_len() as u64) > remaining {
            return Err(KeepError::WalCorruption(format!(
                "truncated payload: {} of {} bytes",
                remaining - HEADER_SIZE as u64,
                header.payload_len
            )));
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        read_exact_or_torn(&mut self.reader, &mut payload)?;

        let entry = decode_payload(&header, &payload, self.codec.as_ref())?;
        self.offset += header.frame_len() as u64;
        Ok(Some(entry))
    }

    /// Byte offset just past the last verified frame
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    /// Iterate over entries until end of file or the first bad frame
    pub fn entries(self) -> SegmentIterator {
        SegmentIterator {
            reader: self,
            finished: false,
        }
    }
}

fn read_exact_or_torn(reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => KeepError::WalCorruption("unexpected end of segment".into()),
        _ => KeepError::Io(e),
    })
}

/// Iterator over one segment's entries
pub struct SegmentIterator {
    reader: SegmentReader,
    finished: bool,
}

impl Iterator for SegmentIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.reader.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

// =============================================================================
// Whole Log
// =============================================================================

/// Reads the WAL across segments in ascending id order
///
/// Enforces strictly increasing sequences across segment boundaries.
pub struct WalReader {
    segments: Vec<SegmentInfo>,
    next_index: usize,
    current: Option<SegmentReader>,
    codec: Arc<dyn EntryCodec>,
    max_entry_size: u32,
    last_sequence: Option<u64>,
    /// Segment the last returned entry came from
    last_segment_id: Option<u64>,
    corruption: Option<CorruptionPoint>,
}

impl WalReader {
    /// Create a reader over the given segments (sorted by id here)
    pub fn new(
        mut segments: Vec<SegmentInfo>,
        codec: Arc<dyn EntryCodec>,
        max_entry_size: u32,
    ) -> Self {
        segments.sort_by_key(|s| s.id);
        Self {
            segments,
            next_index: 0,
            current: None,
            codec,
            max_entry_size,
            last_sequence: None,
            last_segment_id: None,
            corruption: None,
        }
    }

    /// Read the next entry in log order
    ///
    /// After an `Err(WalCorruption)` the reader is finished and
    /// [`WalReader::corruption`] describes the stop point.
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        if self.corruption.is_some() {
            return Ok(None);
        }

        loop {
            if self.current.is_none() {
                let Some(info) = self.segments.get(self.next_index) else {
                    return Ok(None);
                };
                self.next_index += 1;
                let reader = SegmentReader::open_with(
                    &info.path,
                    info.id,
                    Arc::clone(&self.codec),
                    self.max_entry_size,
                )?;
                self.current = Some(reader);
            }

            let Some(reader) = self.current.as_mut() else {
                continue;
            };
            let frame_offset = reader.offset();
            let segment_id = reader.segment_id();

            match reader.next_entry() {
                Ok(Some(entry)) => {
                    if let Some(last) = self.last_sequence {
                        if entry.sequence <= last {
                            let reason = format!(
                                "out-of-order sequence {} after {}",
                                entry.sequence, last
                            );
                            return Err(self.stop(segment_id, frame_offset, reason));
                        }
                    }
                    self.last_sequence = Some(entry.sequence);
                    self.last_segment_id = Some(segment_id);
                    return Ok(Some(entry));
                }
                Ok(None) => {
                    self.current = None;
                }
                Err(KeepError::WalCorruption(reason)) => {
                    return Err(self.stop(segment_id, frame_offset, reason));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn stop(&mut self, segment_id: u64, offset: u64, reason: String) -> KeepError {
        tracing::warn!(segment = segment_id, offset, %reason, "WAL scan stopped at corrupted frame");
        self.corruption = Some(CorruptionPoint {
            segment_id,
            offset,
            reason: reason.clone(),
        });
        self.current = None;
        KeepError::WalCorruption(reason)
    }

    /// Where the scan stopped, if it hit a bad frame
    pub fn corruption(&self) -> Option<&CorruptionPoint> {
        self.corruption.as_ref()
    }

    /// Highest sequence returned so far
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Segment holding the entry returned last
    pub fn last_segment_id(&self) -> Option<u64> {
        self.last_segment_id
    }

    /// Segments after the one where corruption was found
    pub fn segments_after_corruption(&self) -> Vec<SegmentInfo> {
        match &self.corruption {
            Some(point) => self
                .segments
                .iter()
                .filter(|s| s.id > point.segment_id)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

impl Iterator for WalReader {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}
