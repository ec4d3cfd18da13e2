//! Compaction Module
//!
//! Reclaims WAL space once a verified snapshot subsumes it.
//!
//! ## Algorithm
//! 1. Take the watermark of a verified snapshot
//! 2. List sealed segments, ascending by id
//! 3. Always retain the newest `keep_segments` sealed segments
//! 4. Delete every other sealed segment whose max sequence ≤ watermark
//!
//! ## Safety
//! - The active segment is never sealed, so it is never a candidate
//! - Leased segments are skipped by the segment manager
//! - A failed deletion is logged and skipped; running again is harmless

use std::sync::Arc;
use std::time::Instant;

use crate::snapshot::SnapshotMeta;
use crate::wal::SegmentManager;

/// What a compaction run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Ids of deleted segments, ascending
    pub deleted_segments: Vec<u64>,

    pub reclaimed_bytes: u64,

    /// Segments left in the log after the run (active included)
    pub retained_segments: usize,
}

/// Deletes WAL segments covered by a snapshot watermark
pub struct Compactor {
    segments: Arc<SegmentManager>,
    keep_segments: usize,
}

impl Compactor {
    pub fn new(segments: Arc<SegmentManager>, keep_segments: usize) -> Self {
        Self {
            segments,
            keep_segments,
        }
    }

    /// Compact against a snapshot that has already been verified
    pub fn compact(&self, snapshot: &SnapshotMeta) -> CompactionReport {
        self.compact_to(snapshot.watermark)
    }

    /// Compact against a raw watermark
    pub fn compact_to(&self, watermark: u64) -> CompactionReport {
        let started = Instant::now();
        let mut report = CompactionReport::default();

        let sealed = self.segments.sealed_segments();
        let candidates = sealed.len().saturating_sub(self.keep_segments);

        for info in sealed.iter().take(candidates) {
            let covered = info.max_sequence.map_or(true, |max| max <= watermark);
            if !covered {
                continue;
            }

            match self.segments.delete_segment(info.id) {
                Ok(Some(bytes)) => {
                    report.deleted_segments.push(info.id);
                    report.reclaimed_bytes += bytes;
                }
                Ok(None) => {
                    tracing::debug!(segment = info.id, "Segment is active or leased; skipping");
                }
                Err(e) => {
                    tracing::warn!(segment = info.id, error = %e, "Failed to remove WAL segment");
                }
            }
        }

        report.retained_segments = self.segments.segment_count();

        if !report.deleted_segments.is_empty() {
            tracing::info!(
                watermark,
                deleted = report.deleted_segments.len(),
                reclaimed_bytes = report.reclaimed_bytes,
                retained = report.retained_segments,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "WAL compaction completed"
            );
        }
        report
    }
}
