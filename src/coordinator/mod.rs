//! Coordinator Module
//!
//! The persistence facade called on every cache mutation.
//!
//! ## Responsibilities
//! - Recover state into the cache before it serves (`start`)
//! - Dispatch each mutation by persistence mode (`record`)
//! - Run the background pool: WAL worker, snapshot scheduler, compactor
//! - Expose durability health
//! - Drain and flush on `shutdown`, reporting anything left unconfirmed
//!
//! ## Concurrency Model
//! - **Mutations**: serialized by the append mutex, which assigns the
//!   sequence, logs (sync) or enqueues (async), and applies to the cache.
//!   Sync mode holds it across fsync.
//! - **Snapshots**: hold the append mutex only to read the watermark and
//!   take the cache view; at most one runs at a time.
//! - **Lifecycle**: `record` holds a read lock on the lifecycle, `start` and
//!   `shutdown` a write lock, so shutdown waits for in-flight records.

mod health;
mod state;
mod worker;

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, unbounded};
use parking_lot::{Mutex, RwLock};

pub use health::{Health, HealthReport};

use crate::cache::CacheStore;
use crate::compaction::Compactor;
use crate::config::{Config, PersistenceMode};
use crate::error::{KeepError, Result};
use crate::recovery::{RecoveryManager, RecoveryResult};
use crate::snapshot::{SnapshotMeta, SnapshotStore};
use crate::wal::{BincodeCodec, EntryCodec, Operation, SegmentInfo, SegmentManager, WalWriter};

use health::HealthTracker;
use state::{AppendState, CompactorMsg, DurableStore, SchedulerMsg, Shared, Sink, WalCommand};
use worker::{Task, WalWorkerExit};

/// Extra time granted to a cancelled snapshot to remove its temp file
const CANCEL_GRACE: Duration = Duration::from_millis(250);

/// How a recorded operation was acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Logged and fsynced (sync mode)
    Durable(u64),

    /// Queued for the WAL worker (async mode)
    Buffered(u64),

    /// Applied but not logged; health is degraded until a snapshot covers it
    Unlogged(u64),

    /// Applied only in memory (disabled mode)
    Volatile,
}

impl Ack {
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Ack::Durable(seq) | Ack::Buffered(seq) | Ack::Unlogged(seq) => Some(*seq),
            Ack::Volatile => None,
        }
    }
}

/// Work that shutdown could not confirm
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub last_assigned_sequence: u64,
    pub durable_sequence: u64,

    /// Set when sequences after `durable_sequence` up to this one may be lost
    pub unflushed_through: Option<u64>,

    /// An in-flight snapshot was cancelled and removed
    pub snapshot_discarded: bool,

    /// Background threads still running at the deadline
    pub timed_out_tasks: Vec<String>,

    /// Final WAL error, if the last flush failed
    pub wal_error: Option<String>,
}

impl ShutdownReport {
    /// Everything acknowledged was confirmed
    pub fn is_clean(&self) -> bool {
        self.unflushed_through.is_none() && !self.snapshot_discarded && self.timed_out_tasks.is_empty()
    }
}

enum Lifecycle {
    Idle,
    Running(Runtime),
    Stopped,
}

struct Runtime {
    shared: Arc<Shared>,
    wal_worker: Option<Task<WalWorkerExit>>,
    scheduler: Option<Task<()>>,
    compactor: Option<Task<()>>,
}

/// Persistence coordinator
///
/// One instance per cache. `start` recovers into the cache and launches the
/// background threads; `shutdown` stops them.
pub struct Coordinator {
    config: Config,
    codec: Arc<dyn EntryCodec>,
    health: Arc<HealthTracker>,
    lifecycle: RwLock<Lifecycle>,
}

impl Coordinator {
    /// Create a coordinator; the configuration is validated before any I/O
    pub fn new(config: Config) -> Result<Self> {
        Self::with_codec(config, Arc::new(BincodeCodec))
    }

    pub fn with_codec(config: Config, codec: Arc<dyn EntryCodec>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            codec,
            health: Arc::new(HealthTracker::new()),
            lifecycle: RwLock::new(Lifecycle::Idle),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Recover into `cache` and start the background threads
    ///
    /// Steps:
    /// 1. Open the segment directory
    /// 2. Load the newest valid snapshot and replay the WAL tail
    /// 3. Open a WAL writer at the next sequence
    /// 4. Spawn the WAL worker (async), snapshot scheduler and compactor
    pub fn start(&self, cache: Arc<dyn CacheStore>) -> Result<RecoveryResult> {
        let mut lifecycle = self.lifecycle.write();
        match &*lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => {
                return Err(KeepError::Config("coordinator already started".into()))
            }
            Lifecycle::Stopped => return Err(KeepError::ShutDown),
        }

        let mode = self.config.persistence_mode;
        if mode == PersistenceMode::Disabled {
            let shared = Arc::new(self.shared(cache, Sink::Disabled, 0, None));
            *lifecycle = Lifecycle::Running(Runtime {
                shared,
                wal_worker: None,
                scheduler: None,
                compactor: None,
            });
            tracing::info!("Persistence disabled; operations are applied in memory only");
            return Ok(RecoveryResult::default());
        }

        // Step 1: Segment directory
        let segments = Arc::new(SegmentManager::open(
            &self.config.wal_dir(),
            Arc::clone(&self.codec),
            self.config.max_entry_size_bytes,
        )?);

        // Step 2: Recovery
        let recovery = RecoveryManager::with_codec(self.config.clone(), Arc::clone(&self.codec))
            .recover_with(&segments, cache.as_ref())?;
        let last_sequence = recovery.next_sequence() - 1;

        // Step 3: WAL writer
        let writer = WalWriter::open(
            Arc::clone(&segments),
            Arc::clone(&self.codec),
            self.config.wal_segment_size_bytes,
            self.config.max_entry_size_bytes,
            last_sequence,
        )?;
        let snapshots = SnapshotStore::open(
            &self.config.snapshot_dir(),
            self.config.snapshot_compression,
            self.config.snapshot_retention_count,
        )?;

        // Step 4: Background pool
        let (scheduler_tx, scheduler_rx) = unbounded();
        let (compactor_tx, compactor_rx) = unbounded();
        let store = DurableStore {
            compactor: Compactor::new(Arc::clone(&segments), self.config.compaction_keep_segments),
            segments,
            snapshots,
            scheduler_tx,
            compactor_tx,
        };

        let (sink, wal_rx, worker_writer) = match mode {
            PersistenceMode::Async => {
                let (tx, rx) = bounded(self.config.async_queue_capacity);
                (Sink::Async(tx), Some(rx), Some(writer))
            }
            _ => (Sink::Sync(writer), None, None),
        };
        let shared = Arc::new(self.shared(cache, sink, last_sequence, Some(store)));

        self.health.reset(last_sequence);
        if recovery.degraded {
            self.health
                .recovery_lossy("recovery could not restore every logged entry");
        }

        let wal_worker = match (wal_rx, worker_writer) {
            (Some(rx), Some(writer)) => {
                let worker_shared = Arc::clone(&shared);
                Some(Task::spawn("cachekeep-wal", move || {
                    worker::run_wal_worker(writer, rx, worker_shared)
                })?)
            }
            _ => None,
        };
        let scheduler = {
            let shared = Arc::clone(&shared);
            Task::spawn("cachekeep-snapshot", move || {
                worker::run_scheduler(shared, scheduler_rx)
            })?
        };
        let compactor = {
            let shared = Arc::clone(&shared);
            Task::spawn("cachekeep-compactor", move || {
                worker::run_compactor(shared, compactor_rx)
            })?
        };

        *lifecycle = Lifecycle::Running(Runtime {
            shared,
            wal_worker,
            scheduler: Some(scheduler),
            compactor: Some(compactor),
        });

        tracing::info!(
            mode = %mode,
            next_sequence = last_sequence + 1,
            data_dir = %self.config.data_dir.display(),
            "Persistence coordinator started"
        );
        Ok(recovery)
    }

    fn shared(
        &self,
        cache: Arc<dyn CacheStore>,
        sink: Sink,
        last_sequence: u64,
        store: Option<DurableStore>,
    ) -> Shared {
        Shared {
            config: self.config.clone(),
            cache,
            health: Arc::clone(&self.health),
            append: Mutex::new(AppendState {
                last_sequence,
                sink,
            }),
            store,
            retry: self.config.retry_policy(),
            snapshot_gate: Mutex::new(()),
            snapshot_running: AtomicBool::new(false),
            cancel_snapshot: AtomicBool::new(false),
        }
    }

    /// Stop the background threads, drain and flush
    ///
    /// Waits at most `shutdown_timeout_ms` in total. An in-flight snapshot
    /// still running at the deadline is cancelled and discarded.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut lifecycle = self.lifecycle.write();
        let runtime = match mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(runtime) => runtime,
            Lifecycle::Idle | Lifecycle::Stopped => return ShutdownReport::default(),
        };

        let started = Instant::now();
        let deadline = started + self.config.shutdown_timeout();
        let shared = runtime.shared;
        let mut report = ShutdownReport::default();

        // Step 1: Stop timers
        if let Some(store) = &shared.store {
            let _ = store.scheduler_tx.send(SchedulerMsg::Stop);
        }

        // Step 2: Drain the WAL path
        let (sink, last_assigned) = {
            let mut state = shared.append.lock();
            (mem::replace(&mut state.sink, Sink::Disabled), state.last_sequence)
        };
        report.last_assigned_sequence = last_assigned;

        let durable = match sink {
            Sink::Disabled => None,
            Sink::Sync(writer) => match writer.close() {
                Ok(durable) => Some(durable),
                Err(e) => {
                    report.wal_error = Some(e.to_string());
                    Some(self.health.durable_sequence())
                }
            },
            Sink::Async(tx) => {
                let _ = tx.send(WalCommand::Shutdown);
                drop(tx);
                match runtime.wal_worker.map(|task| task.wait_until(deadline)) {
                    Some(Some(Ok(exit))) => {
                        report.wal_error = exit.error;
                        Some(exit.durable_sequence)
                    }
                    Some(Some(Err(_))) => {
                        report.wal_error = Some("WAL worker panicked".into());
                        Some(self.health.durable_sequence())
                    }
                    Some(None) => {
                        report.timed_out_tasks.push("wal".into());
                        Some(self.health.durable_sequence())
                    }
                    None => Some(self.health.durable_sequence()),
                }
            }
        };

        if let Some(durable) = durable {
            // A snapshot also confirms everything up to its watermark
            let durable = durable.max(self.health.durable_sequence());
            report.durable_sequence = durable;
            if durable < last_assigned {
                report.unflushed_through = Some(last_assigned);
            }
        }

        // Step 3: In-flight snapshot
        if let Some(task) = runtime.scheduler {
            if task.wait_until(deadline).is_none() {
                report.timed_out_tasks.push("snapshot".into());
            }
        }
        // A snapshot_now() caller may still be writing
        while shared.snapshot_running.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        shared.cancel_snapshot.store(true, Ordering::SeqCst);
        if shared.snapshot_running.load(Ordering::SeqCst) {
            // Let the writer notice the flag and remove its temp file
            let grace = Instant::now() + CANCEL_GRACE;
            while shared.snapshot_running.load(Ordering::SeqCst) && Instant::now() < grace {
                std::thread::sleep(Duration::from_millis(5));
            }
            report.snapshot_discarded = true;
        }

        // Step 4: Compaction
        if let Some(store) = &shared.store {
            let _ = store.compactor_tx.send(CompactorMsg::Stop);
        }
        if let Some(task) = runtime.compactor {
            if task.wait_until(deadline).is_none() {
                report.timed_out_tasks.push("compaction".into());
            }
        }

        if report.is_clean() {
            tracing::info!(
                durable_sequence = report.durable_sequence,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Persistence coordinator stopped"
            );
        } else {
            tracing::warn!(
                durable_sequence = report.durable_sequence,
                unflushed_through = ?report.unflushed_through,
                snapshot_discarded = report.snapshot_discarded,
                timed_out = ?report.timed_out_tasks,
                "Persistence coordinator stopped with unconfirmed work"
            );
        }
        report
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Log and apply one mutation according to the persistence mode
    pub fn record(&self, operation: Operation) -> Result<Ack> {
        let lifecycle = self.lifecycle.read();
        match &*lifecycle {
            Lifecycle::Running(runtime) => runtime.shared.record(operation),
            Lifecycle::Idle => Err(KeepError::NotRunning),
            Lifecycle::Stopped => Err(KeepError::ShutDown),
        }
    }

    /// Take a snapshot now, serialized with the scheduler
    pub fn snapshot_now(&self) -> Result<SnapshotMeta> {
        self.running()?.take_snapshot()
    }

    /// Force everything recorded so far onto stable storage
    ///
    /// Returns the highest durable sequence. In disabled mode nothing is
    /// durable and 0 is returned.
    pub fn flush(&self) -> Result<u64> {
        let shared = self.running()?;
        let reply = {
            let mut state = shared.append.lock();
            match &mut state.sink {
                Sink::Disabled => return Ok(0),
                Sink::Sync(writer) => {
                    let durable = writer.flush()?;
                    self.health.flushed(durable);
                    return Ok(durable);
                }
                Sink::Async(tx) => {
                    let (reply_tx, reply_rx) = bounded(1);
                    tx.send(WalCommand::Sync(reply_tx))
                        .map_err(|_| KeepError::WalWrite("WAL worker stopped".into()))?;
                    reply_rx
                }
            }
        };

        reply
            .recv()
            .map_err(|_| KeepError::WalWrite("WAL worker stopped".into()))?
    }

    /// Current durability health
    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    /// WAL segments currently on disk (empty when disabled or stopped)
    pub fn wal_segments(&self) -> Vec<SegmentInfo> {
        match self.running() {
            Ok(shared) => shared
                .store
                .as_ref()
                .map(|store| store.segments.segments())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    pub fn mode(&self) -> PersistenceMode {
        self.config.persistence_mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lifecycle.read(), Lifecycle::Running(_))
    }

    fn running(&self) -> Result<Arc<Shared>> {
        match &*self.lifecycle.read() {
            Lifecycle::Running(runtime) => Ok(Arc::clone(&runtime.shared)),
            Lifecycle::Idle => Err(KeepError::NotRunning),
            Lifecycle::Stopped => Err(KeepError::ShutDown),
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.is_running() {
            let report = self.shutdown();
            if !report.is_clean() {
                tracing::warn!(?report, "Coordinator dropped without a clean shutdown");
            }
        }
    }
}
