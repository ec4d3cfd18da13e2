//! State shared between the append path and the background threads

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{Sender, TrySendError};
use parking_lot::Mutex;

use crate::cache::CacheStore;
use crate::compaction::Compactor;
use crate::config::{BackpressurePolicy, Config};
use crate::error::{KeepError, Result, RetryPolicy};
use crate::snapshot::{SnapshotMeta, SnapshotStore};
use crate::wal::{Operation, SegmentManager, WalEntry, WalWriter};

use super::health::HealthTracker;
use super::Ack;

/// Where appended operations go, chosen once at start
pub(crate) enum Sink {
    Disabled,
    Sync(WalWriter),
    Async(Sender<WalCommand>),
}

/// Everything guarded by the append mutex
pub(crate) struct AppendState {
    /// Highest sequence assigned so far
    pub last_sequence: u64,
    pub sink: Sink,
}

/// Messages for the async WAL worker
pub(crate) enum WalCommand {
    Append(WalEntry),
    /// Flush now and report the durable sequence
    Sync(Sender<Result<u64>>),
    /// Drain the queue, flush and exit
    Shutdown,
}

pub(crate) enum SchedulerMsg {
    /// Take a snapshot as soon as possible
    Request,
    Stop,
}

pub(crate) enum CompactorMsg {
    Compact(SnapshotMeta),
    Stop,
}

/// Snapshot and WAL files; absent when persistence is disabled
pub(crate) struct DurableStore {
    pub segments: Arc<SegmentManager>,
    pub snapshots: SnapshotStore,
    pub compactor: Compactor,
    pub scheduler_tx: Sender<SchedulerMsg>,
    pub compactor_tx: Sender<CompactorMsg>,
}

pub(crate) struct Shared {
    pub config: Config,
    pub cache: Arc<dyn CacheStore>,
    pub health: Arc<HealthTracker>,
    pub append: Mutex<AppendState>,
    pub store: Option<DurableStore>,
    pub retry: RetryPolicy,

    /// Serializes snapshot creation (scheduler and `snapshot_now`)
    pub snapshot_gate: Mutex<()>,
    pub snapshot_running: AtomicBool,
    /// Raised at shutdown; polled by the snapshot writer
    pub cancel_snapshot: AtomicBool,
}

impl Shared {
    // =========================================================================
    // Append Path
    // =========================================================================

    /// Log and apply one operation
    ///
    /// The append mutex is held for the whole call, so sequence order,
    /// WAL order and cache order are the same.
    pub fn record(&self, operation: Operation) -> Result<Ack> {
        self.check_size(&operation)?;

        let mut state = self.append.lock();
        let sequence = state.last_sequence + 1;

        let ack = match &mut state.sink {
            Sink::Disabled => Ack::Volatile,
            Sink::Sync(writer) => {
                let logged = writer.append(operation.clone()).and_then(|seq| {
                    self.retry.run("wal flush", || writer.flush())?;
                    Ok(seq)
                });
                match logged {
                    Ok(seq) => {
                        self.health.flushed(seq);
                        Ack::Durable(seq)
                    }
                    Err(e) => {
                        if writer.last_sequence() > writer.durable_sequence() {
                            writer.discard_unflushed();
                        }
                        if matches!(e, KeepError::Io(_)) {
                            self.health.wal_failed(e.to_string());
                        }
                        return Err(e);
                    }
                }
            }
            Sink::Async(tx) => {
                let command = WalCommand::Append(WalEntry::new(sequence, operation.clone()));
                match self.config.backpressure_policy {
                    BackpressurePolicy::Block => {
                        if tx.send(command).is_err() {
                            self.health.failed("WAL worker stopped");
                            return Err(KeepError::WalWrite("WAL worker stopped".into()));
                        }
                        Ack::Buffered(sequence)
                    }
                    BackpressurePolicy::SignalDegraded => match tx.try_send(command) {
                        Ok(()) => Ack::Buffered(sequence),
                        Err(TrySendError::Full(_)) => {
                            self.health.unlogged(sequence, "async queue full");
                            self.request_snapshot();
                            Ack::Unlogged(sequence)
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            self.health.failed("WAL worker stopped");
                            return Err(KeepError::WalWrite("WAL worker stopped".into()));
                        }
                    },
                }
            }
        };

        self.cache.apply_operation(&operation);
        state.last_sequence = sequence;
        self.health.assigned(sequence);
        Ok(ack)
    }

    /// Reject entries that can never fit in a frame
    fn check_size(&self, operation: &Operation) -> Result<()> {
        let len = operation.data_len();
        if len > self.config.max_entry_size_bytes as usize {
            return Err(KeepError::WalWrite(format!(
                "entry of {} bytes exceeds max_entry_size_bytes {}",
                len, self.config.max_entry_size_bytes
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Ask the scheduler for a snapshot; duplicate requests coalesce
    pub fn request_snapshot(&self) {
        if let Some(store) = &self.store {
            let _ = store.scheduler_tx.send(SchedulerMsg::Request);
        }
    }

    /// Write, verify and publish a snapshot, then hand it to the compactor
    pub fn take_snapshot(&self) -> Result<SnapshotMeta> {
        let Some(store) = &self.store else {
            return Err(KeepError::Config("persistence is disabled".into()));
        };

        let _gate = self.snapshot_gate.lock();
        if self.cancel_snapshot.load(Ordering::SeqCst) {
            return Err(KeepError::SnapshotAborted("coordinator is shutting down".into()));
        }

        // Fix the watermark and the view together; writing happens unlocked
        let (watermark, records) = {
            let state = self.append.lock();
            (state.last_sequence, self.cache.iterate_all())
        };

        self.snapshot_running.store(true, Ordering::SeqCst);
        let created = store
            .snapshots
            .create(records, watermark, &self.cancel_snapshot);
        self.snapshot_running.store(false, Ordering::SeqCst);

        match created {
            Ok(meta) => {
                self.health.snapshot_verified(meta.watermark);
                let _ = store.compactor_tx.send(CompactorMsg::Compact(meta.clone()));
                Ok(meta)
            }
            Err(KeepError::SnapshotAborted(reason)) => {
                tracing::warn!(%reason, watermark, "Snapshot discarded");
                Err(KeepError::SnapshotAborted(reason))
            }
            Err(e) => {
                self.health.snapshot_failed(e.to_string());
                Err(e)
            }
        }
    }
}
