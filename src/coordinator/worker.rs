//! Background threads
//!
//! ```text
//!   record() ──► [bounded queue] ──► cachekeep-wal        (async mode only)
//!                                      append, flush on timer / buffer size
//!
//!   timer / request ──────────────► cachekeep-snapshot
//!                                      snapshot, verify, retention
//!                                            │ verified SnapshotMeta
//!                                            ▼
//!                                    cachekeep-compactor
//!                                      delete covered segments
//! ```
//! Every thread signals completion on its own channel so shutdown can wait
//! with a deadline instead of joining blindly.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};

use crate::error::{KeepError, Result};
use crate::wal::{WalEntry, WalWriter};

use super::state::{CompactorMsg, SchedulerMsg, Shared, WalCommand};

// =============================================================================
// Task Handles
// =============================================================================

/// A named background thread with a completion signal
pub(crate) struct Task<T> {
    pub name: &'static str,
    handle: JoinHandle<T>,
    done: Receiver<()>,
}

impl<T: Send + 'static> Task<T> {
    pub fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let (done_tx, done) = bounded(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let value = body();
                let _ = done_tx.send(());
                value
            })?;

        tracing::debug!(thread = name, "Started background thread");
        Ok(Self { name, handle, done })
    }

    /// Wait for the thread until `deadline`
    ///
    /// Returns `None` on timeout; the thread is then left running detached.
    pub fn wait_until(self, deadline: Instant) -> Option<thread::Result<T>> {
        match self.done.recv_deadline(deadline) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Some(self.handle.join()),
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(thread = self.name, "Background thread did not stop in time");
                None
            }
        }
    }
}

// =============================================================================
// WAL Worker (async mode)
// =============================================================================

/// Final state of the WAL worker
#[derive(Debug, Clone, Default)]
pub(crate) struct WalWorkerExit {
    pub durable_sequence: u64,
    pub last_sequence: u64,
    pub error: Option<String>,
}

pub(crate) fn run_wal_worker(
    mut writer: WalWriter,
    rx: Receiver<WalCommand>,
    shared: Arc<Shared>,
) -> WalWorkerExit {
    let interval = shared.config.wal_flush_interval();
    let buffer_limit = shared.config.wal_buffer_size_bytes;
    let mut deadline = Instant::now() + interval;

    loop {
        match rx.recv_deadline(deadline) {
            Ok(WalCommand::Append(entry)) => {
                append(&mut writer, &shared, &entry);
                if writer.buffered_bytes() >= buffer_limit {
                    let _ = flush(&mut writer, &shared);
                    deadline = Instant::now() + interval;
                }
            }
            Ok(WalCommand::Sync(reply)) => {
                let durable = flush(&mut writer, &shared);
                let _ = reply.send(durable);
            }
            Ok(WalCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if writer.buffered_bytes() > 0 {
                    let _ = flush(&mut writer, &shared);
                }
                deadline = Instant::now() + interval;
            }
        }
    }

    // Drain whatever is still queued, then flush once
    let mut drained = 0usize;
    while let Ok(command) = rx.try_recv() {
        match command {
            WalCommand::Append(entry) => {
                append(&mut writer, &shared, &entry);
                drained += 1;
            }
            WalCommand::Sync(reply) => {
                let _ = reply.send(flush(&mut writer, &shared));
            }
            WalCommand::Shutdown => {}
        }
    }

    let last_sequence = writer.last_sequence();
    let error = flush(&mut writer, &shared).err().map(|e| e.to_string());
    let durable_sequence = writer.durable_sequence();
    if let Err(e) = writer.close() {
        tracing::warn!(error = %e, "Failed to close WAL writer");
    }

    tracing::info!(drained, durable_sequence, "WAL worker stopped");
    WalWorkerExit {
        durable_sequence,
        last_sequence,
        error,
    }
}

fn append(writer: &mut WalWriter, shared: &Shared, entry: &WalEntry) {
    if let Err(e) = writer.append_entry(entry) {
        // A failed write also discards everything since the last flush
        if matches!(e, KeepError::Io(_)) {
            shared.health.wal_failed(e.to_string());
        }
        shared.health.unlogged(entry.sequence, e.to_string());
        shared.request_snapshot();
    }
}

fn flush(writer: &mut WalWriter, shared: &Shared) -> Result<u64> {
    match shared.retry.run("wal flush", || writer.flush()) {
        Ok(durable) => {
            shared.health.flushed(durable);
            Ok(durable)
        }
        Err(e) => {
            let lost_through = writer.last_sequence();
            writer.discard_unflushed();
            shared.health.wal_failed(e.to_string());
            shared.health.unlogged(lost_through, "WAL flush failed");
            shared.request_snapshot();
            Err(e)
        }
    }
}

// =============================================================================
// Snapshot Scheduler
// =============================================================================

pub(crate) fn run_scheduler(shared: Arc<Shared>, rx: Receiver<SchedulerMsg>) {
    let interval = shared.config.snapshot_interval();
    let mut deadline = Instant::now() + interval;

    loop {
        match rx.recv_deadline(deadline) {
            Ok(SchedulerMsg::Request) | Err(RecvTimeoutError::Timeout) => {}
            Ok(SchedulerMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }

        // Coalesce queued requests
        let mut stop = false;
        while let Ok(msg) = rx.try_recv() {
            if let SchedulerMsg::Stop = msg {
                stop = true;
            }
        }
        if stop {
            break;
        }

        match shared.take_snapshot() {
            Ok(meta) => tracing::debug!(watermark = meta.watermark, "Scheduled snapshot done"),
            Err(e) => tracing::warn!(error = %e, "Scheduled snapshot failed"),
        }
        deadline = Instant::now() + interval;
    }

    tracing::debug!("Snapshot scheduler stopped");
}

// =============================================================================
// Compactor
// =============================================================================

pub(crate) fn run_compactor(shared: Arc<Shared>, rx: Receiver<CompactorMsg>) {
    let Some(store) = &shared.store else {
        return;
    };

    while let Ok(CompactorMsg::Compact(mut meta)) = rx.recv() {
        // Only the newest verified snapshot matters
        let mut stop = false;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                CompactorMsg::Compact(newer) if newer.watermark >= meta.watermark => meta = newer,
                CompactorMsg::Compact(_) => {}
                CompactorMsg::Stop => stop = true,
            }
        }

        let report = store.compactor.compact(&meta);
        tracing::debug!(
            watermark = meta.watermark,
            deleted = report.deleted_segments.len(),
            "Compaction pass done"
        );

        if stop {
            break;
        }
    }

    tracing::debug!("Compactor stopped");
}
