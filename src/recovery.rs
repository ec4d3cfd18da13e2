//! Recovery Module
//!
//! Reconstructs cache state at startup, before the cache serves traffic.
//!
//! ## Recovery Process
//! ```text
//! 1. Snapshots, newest first ──► verify checksum ──► load (cache cleared
//!    before each attempt); fall back to older ones, then to "none"
//! 2. WAL segments, ascending ──► skip sequence ≤ watermark ──► apply
//! 3. First bad frame ──► stop (never skip forward)
//!                        truncate the torn segment at the bad frame
//!                        quarantine every later segment
//! ```
//! The writer resumes at `max(watermark, last applied) + 1`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{CacheStore, MemCache};
use crate::config::Config;
use crate::error::{KeepError, Result};
use crate::snapshot::{self, SnapshotMeta, SnapshotReader};
use crate::wal::{BincodeCodec, CorruptionPoint, EntryCodec, Operation, SegmentManager, WalReader};

/// A snapshot that could not be loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedSnapshot {
    pub path: PathBuf,
    pub reason: String,
}

/// A jump in WAL sequence numbers found during replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// Sequence replay needed next
    pub expected: u64,
    /// Sequence the log actually held
    pub found: u64,
}

impl SequenceGap {
    /// Number of sequences missing from the log
    pub fn missing(&self) -> u64 {
        self.found - self.expected
    }
}

/// Outcome of a recovery run
#[derive(Debug, Clone, Default)]
pub struct RecoveryResult {
    /// Records loaded from the snapshot
    pub loaded_entry_count: u64,

    /// WAL entries applied on top of the snapshot
    pub replayed_entry_count: u64,

    /// Highest sequence reflected in the recovered state (0 = none)
    pub last_applied_sequence: u64,

    /// Last trusted sequence, set when replay stopped at a bad frame
    pub corruption_boundary: Option<u64>,

    pub elapsed: Duration,

    /// Snapshot the state was rebuilt from
    pub snapshot: Option<SnapshotMeta>,

    /// Snapshots skipped because they failed verification
    pub rejected_snapshots: Vec<RejectedSnapshot>,

    /// Where replay stopped early
    pub corruption: Option<CorruptionPoint>,

    /// Segments moved aside because they follow a bad frame
    pub quarantined_segments: Vec<PathBuf>,

    /// Whether the torn segment was cut back to its trusted prefix
    pub truncated: bool,

    /// First place where replay skipped over unlogged sequences
    pub first_gap: Option<SequenceGap>,

    /// Recovery completed but some state may be missing
    pub degraded: bool,
}

impl RecoveryResult {
    /// Watermark of the loaded snapshot (0 without one)
    pub fn watermark(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.watermark)
    }

    /// First sequence the WAL writer should assign
    pub fn next_sequence(&self) -> u64 {
        self.watermark().max(self.last_applied_sequence) + 1
    }
}

/// Rebuilds state from snapshots and the WAL
pub struct RecoveryManager {
    config: Config,
    codec: Arc<dyn EntryCodec>,
}

impl RecoveryManager {
    pub fn new(config: Config) -> Self {
        Self::with_codec(config, Arc::new(BincodeCodec))
    }

    pub fn with_codec(config: Config, codec: Arc<dyn EntryCodec>) -> Self {
        Self { config, codec }
    }

    /// Recover into `cache`, repairing a torn WAL tail
    pub fn recover(&self, cache: &dyn CacheStore) -> Result<RecoveryResult> {
        self.config.validate()?;
        let segments = SegmentManager::open(
            &self.config.wal_dir(),
            Arc::clone(&self.codec),
            self.config.max_entry_size_bytes,
        )?;
        self.recover_with(&segments, cache)
    }

    /// Recover into a fresh [`MemCache`]
    pub fn recover_mem(&self) -> Result<(MemCache, RecoveryResult)> {
        let cache = MemCache::new();
        let result = self.recover(&cache)?;
        Ok((cache, result))
    }

    /// Compute the recovery result without touching any file
    pub fn inspect(&self) -> Result<RecoveryResult> {
        self.config.validate()?;
        let wal_dir = self.config.wal_dir();
        let scratch = MemCache::new();

        if !wal_dir.exists() {
            return self.run(None, &scratch, false);
        }
        let segments = SegmentManager::open(
            &wal_dir,
            Arc::clone(&self.codec),
            self.config.max_entry_size_bytes,
        )?;
        self.run(Some(&segments), &scratch, false)
    }

    /// Recover using an already-open segment manager
    pub(crate) fn recover_with(
        &self,
        segments: &SegmentManager,
        cache: &dyn CacheStore,
    ) -> Result<RecoveryResult> {
        snapshot::cleanup_temp_files(&self.config.snapshot_dir())?;
        self.run(Some(segments), cache, true)
    }

    fn run(
        &self,
        segments: Option<&SegmentManager>,
        cache: &dyn CacheStore,
        repair: bool,
    ) -> Result<RecoveryResult> {
        let started = Instant::now();
        let mut result = RecoveryResult::default();

        tracing::info!(data_dir = %self.config.data_dir.display(), repair, "Starting recovery");

        // =====================================================================
        // Phase 1: Snapshot
        // =====================================================================
        self.load_snapshot(cache, &mut result)?;
        let watermark = result.watermark();
        result.last_applied_sequence = watermark;

        // =====================================================================
        // Phase 2: WAL replay
        // =====================================================================
        if let Some(segments) = segments {
            self.replay(segments, cache, watermark, repair, &mut result)?;
        }

        result.elapsed = started.elapsed();
        if result.degraded {
            tracing::warn!(
                loaded = result.loaded_entry_count,
                replayed = result.replayed_entry_count,
                last_applied = result.last_applied_sequence,
                corruption_boundary = ?result.corruption_boundary,
                "Recovery completed in degraded state"
            );
        } else {
            tracing::info!(
                loaded = result.loaded_entry_count,
                replayed = result.replayed_entry_count,
                last_applied = result.last_applied_sequence,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "Recovery completed"
            );
        }
        Ok(result)
    }

    fn load_snapshot(&self, cache: &dyn CacheStore, result: &mut RecoveryResult) -> Result<()> {
        let mut candidates = snapshot::list_snapshots(&self.config.snapshot_dir())?;
        candidates.reverse();

        for candidate in &candidates {
            cache.apply_operation(&Operation::Clear);

            let mut loaded = 0u64;
            let outcome = SnapshotReader::load(&candidate.path, |record| {
                cache.apply_operation(&Operation::from(record));
                loaded += 1;
            });

            match outcome {
                Ok(meta) => {
                    tracing::info!(
                        path = %meta.path.display(),
                        watermark = meta.watermark,
                        entries = loaded,
                        "Loaded snapshot"
                    );
                    result.loaded_entry_count = loaded;
                    result.snapshot = Some(meta);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        path = %candidate.path.display(),
                        error = %e,
                        "Rejected snapshot, falling back"
                    );
                    result.rejected_snapshots.push(RejectedSnapshot {
                        path: candidate.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        cache.apply_operation(&Operation::Clear);
        if !candidates.is_empty() {
            tracing::error!(
                rejected = candidates.len(),
                "No usable snapshot; recovering from the WAL alone"
            );
            result.degraded = true;
        }
        Ok(())
    }

    fn replay(
        &self,
        segments: &SegmentManager,
        cache: &dyn CacheStore,
        watermark: u64,
        repair: bool,
        result: &mut RecoveryResult,
    ) -> Result<()> {
        let lease = segments.lease_all();
        let mut reader = WalReader::new(
            segments.segments(),
            Arc::clone(&self.codec),
            self.config.max_entry_size_bytes,
        );

        // (segment id, sequence) of the last good frame
        let mut last_good: Option<(u64, u64)> = None;

        loop {
            let entry = match reader.next_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(KeepError::WalCorruption(_)) => break,
                Err(e) => return Err(e),
            };
            if let Some(segment) = reader.last_segment_id() {
                last_good = Some((segment, entry.sequence));
            }

            if entry.sequence <= watermark {
                continue;
            }
            let expected = result.last_applied_sequence + 1;
            if entry.sequence != expected {
                tracing::warn!(
                    expected,
                    found = entry.sequence,
                    "Sequence gap in WAL; entries between were never logged"
                );
                result.first_gap.get_or_insert(SequenceGap {
                    expected,
                    found: entry.sequence,
                });
                result.degraded = true;
            }

            cache.apply_operation(&entry.operation);
            result.last_applied_sequence = entry.sequence;
            result.replayed_entry_count += 1;
        }

        let Some(point) = reader.corruption().cloned() else {
            return Ok(());
        };

        result.corruption_boundary = Some(result.last_applied_sequence);
        result.degraded = true;
        let later = reader.segments_after_corruption();
        drop(reader);
        drop(lease);

        if repair {
            let max_sequence = match last_good {
                Some((segment, sequence)) if segment == point.segment_id => Some(sequence),
                _ => None,
            };
            segments.truncate(point.segment_id, point.offset, max_sequence)?;
            result.truncated = true;

            for info in later {
                result.quarantined_segments.push(segments.quarantine(info.id)?);
            }
        } else {
            result.quarantined_segments = later.into_iter().map(|s| s.path).collect();
        }

        result.corruption = Some(point);
        Ok(())
    }
}
