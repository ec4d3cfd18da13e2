//! Durability health
//!
//! Tracks conditions under which acknowledged writes may not survive a
//! crash, and how each one clears:
//! - WAL write/flush failure: cleared by the next successful flush
//! - Unlogged sequences (dropped or discarded entries): cleared by a
//!   verified snapshot whose watermark covers them
//! - Snapshot failure or lossy recovery: cleared by the next verified snapshot
//! - Failed: a background component is gone; never clears

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Overall durability status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Degraded { reason: String },
    Failed { reason: String },
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Health::Healthy)
    }
}

/// Point-in-time view of durability health
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: Health,

    /// Highest sequence confirmed on stable storage (WAL or snapshot)
    pub last_durable_sequence: u64,

    /// Highest sequence handed out by `record`
    pub last_assigned_sequence: u64,

    /// Highest sequence acknowledged without being logged
    pub unlogged_through: Option<u64>,

    /// Watermark of the last verified snapshot
    pub last_snapshot_watermark: Option<u64>,
}

#[derive(Debug, Default)]
struct Conditions {
    wal_error: Option<String>,
    unlogged_through: Option<u64>,
    unlogged_reason: Option<String>,
    snapshot_error: Option<String>,
    recovery_loss: Option<String>,
    failed: Option<String>,
    last_snapshot_watermark: Option<u64>,
}

/// Shared health state, updated by the append path and background threads
#[derive(Debug, Default)]
pub(crate) struct HealthTracker {
    conditions: Mutex<Conditions>,
    durable: AtomicU64,
    assigned: AtomicU64,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> HealthReport {
        let c = self.conditions.lock();
        let status = if let Some(reason) = &c.failed {
            Health::Failed {
                reason: reason.clone(),
            }
        } else if let Some(reason) = c
            .wal_error
            .as_ref()
            .or(c.unlogged_reason.as_ref())
            .or(c.snapshot_error.as_ref())
            .or(c.recovery_loss.as_ref())
        {
            Health::Degraded {
                reason: reason.clone(),
            }
        } else {
            Health::Healthy
        };

        HealthReport {
            status,
            last_durable_sequence: self.durable.load(Ordering::SeqCst),
            last_assigned_sequence: self.assigned.load(Ordering::SeqCst),
            unlogged_through: c.unlogged_through,
            last_snapshot_watermark: c.last_snapshot_watermark,
        }
    }

    // =========================================================================
    // Sequence Progress
    // =========================================================================

    pub fn reset(&self, last_sequence: u64) {
        self.durable.store(last_sequence, Ordering::SeqCst);
        self.assigned.store(last_sequence, Ordering::SeqCst);
    }

    pub fn assigned(&self, sequence: u64) {
        self.assigned.fetch_max(sequence, Ordering::SeqCst);
    }

    /// A WAL flush confirmed everything up to `sequence`
    pub fn flushed(&self, sequence: u64) {
        self.durable.fetch_max(sequence, Ordering::SeqCst);
        let mut c = self.conditions.lock();
        if c.wal_error.take().is_some() {
            tracing::info!(sequence, "WAL writes succeeding again");
        }
    }

    pub fn durable_sequence(&self) -> u64 {
        self.durable.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Conditions
    // =========================================================================

    pub fn wal_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(%reason, "Durability degraded: WAL failure");
        self.conditions.lock().wal_error = Some(format!("WAL failure: {}", reason));
    }

    /// Sequences up to `sequence` were acknowledged but are not in the WAL
    pub fn unlogged(&self, sequence: u64, reason: impl Into<String>) {
        let reason = reason.into();
        let mut c = self.conditions.lock();
        if c.unlogged_through.is_none() {
            tracing::warn!(sequence, %reason, "Durability degraded: entries not logged");
        }
        c.unlogged_through = Some(c.unlogged_through.map_or(sequence, |s| s.max(sequence)));
        c.unlogged_reason = Some(format!("unlogged entries through {}: {}", sequence, reason));
    }

    pub fn snapshot_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(%reason, "Snapshot failed");
        self.conditions.lock().snapshot_error = Some(format!("snapshot failure: {}", reason));
    }

    pub fn recovery_lossy(&self, reason: impl Into<String>) {
        self.conditions.lock().recovery_loss = Some(reason.into());
    }

    /// A snapshot with `watermark` was written and verified
    pub fn snapshot_verified(&self, watermark: u64) {
        self.durable.fetch_max(watermark, Ordering::SeqCst);

        let mut c = self.conditions.lock();
        c.last_snapshot_watermark = Some(watermark);
        c.snapshot_error = None;
        c.recovery_loss = None;
        if matches!(c.unlogged_through, Some(through) if through <= watermark) {
            tracing::info!(watermark, "Snapshot covers unlogged entries; durability restored");
            c.unlogged_through = None;
            c.unlogged_reason = None;
        }
    }

    pub fn failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(%reason, "Durability failed");
        self.conditions.lock().failed = Some(reason);
    }
}
