//! Configuration for cachekeep
//!
//! Centralized configuration with sensible defaults. All thresholds are
//! checked by [`Config::validate`] before any file is touched.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{KeepError, Result, RetryPolicy};

/// Main configuration for the persistence layer
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── wal/          (wal-0000000001.log, ...)
    ///     └── snapshots/    (snapshot-<timestamp>-<watermark>.snap, ...)
    pub data_dir: PathBuf,

    /// How mutations are made durable
    pub persistence_mode: PersistenceMode,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Rotate the active segment before it would exceed this size (bytes)
    pub wal_segment_size_bytes: u64,

    /// Async mode: flush at least this often (milliseconds)
    pub wal_flush_interval_ms: u64,

    /// Async mode: flush early once this many bytes are buffered
    pub wal_buffer_size_bytes: usize,

    /// Largest encoded entry payload accepted on write and on read
    pub max_entry_size_bytes: u32,

    // -------------------------------------------------------------------------
    // Async Queue Configuration
    // -------------------------------------------------------------------------
    /// Capacity of the bounded queue between callers and the WAL worker
    pub async_queue_capacity: usize,

    /// What happens when the async queue is full
    pub backpressure_policy: BackpressurePolicy,

    // -------------------------------------------------------------------------
    // Snapshot / Compaction Configuration
    // -------------------------------------------------------------------------
    /// Interval between periodic snapshots (milliseconds)
    pub snapshot_interval_ms: u64,

    /// Number of verified snapshots to keep
    pub snapshot_retention_count: usize,

    /// Compress snapshot payloads with zstd
    pub snapshot_compression: bool,

    /// Sealed segments always kept by the compactor, newest first
    pub compaction_keep_segments: usize,

    // -------------------------------------------------------------------------
    // Lifecycle / Retry Configuration
    // -------------------------------------------------------------------------
    /// Upper bound for the shutdown drain (milliseconds)
    pub shutdown_timeout_ms: u64,

    /// Attempts for transient I/O failures (including the first)
    pub io_retry_attempts: u32,

    /// Initial backoff between retries (milliseconds, doubles per retry)
    pub io_retry_backoff_ms: u64,
}

/// Durability mode, fixed when the coordinator is constructed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    /// Append and fsync before acknowledging the mutation
    Sync,

    /// Acknowledge after enqueueing; a background worker writes and flushes
    Async,

    /// Pure in-memory operation
    Disabled,
}

/// Behaviour of async mode when the bounded queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Block the caller until the worker makes room
    Block,

    /// Do not wait: the entry is not logged and durability health degrades
    SignalDegraded,
}

impl FromStr for PersistenceMode {
    type Err = KeepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            "disabled" => Ok(Self::Disabled),
            other => Err(KeepError::Config(format!(
                "unknown persistence mode '{}' (expected sync, async or disabled)",
                other
            ))),
        }
    }
}

impl fmt::Display for PersistenceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

impl FromStr for BackpressurePolicy {
    type Err = KeepError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "block" => Ok(Self::Block),
            "signal-degraded" | "degrade" => Ok(Self::SignalDegraded),
            other => Err(KeepError::Config(format!(
                "unknown backpressure policy '{}' (expected block or signal-degraded)",
                other
            ))),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./cachekeep_data"),
            persistence_mode: PersistenceMode::Sync,
            wal_segment_size_bytes: 64 * 1024 * 1024, // 64 MB
            wal_flush_interval_ms: 100,
            wal_buffer_size_bytes: 256 * 1024,
            max_entry_size_bytes: 16 * 1024 * 1024, // 16 MB
            async_queue_capacity: 8192,
            backpressure_policy: BackpressurePolicy::Block,
            snapshot_interval_ms: 5 * 60 * 1000,
            snapshot_retention_count: 3,
            snapshot_compression: false,
            compaction_keep_segments: 1,
            shutdown_timeout_ms: 5000,
            io_retry_attempts: 3,
            io_retry_backoff_ms: 10,
        }
    }
}

impl Config {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const WAL_DIR: &'static str = "wal";
    const SNAPSHOT_DIR: &'static str = "snapshots";

    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Directory holding WAL segments
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join(Self::WAL_DIR)
    }

    /// Directory holding snapshots
    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join(Self::SNAPSHOT_DIR)
    }

    pub fn wal_flush_interval(&self) -> Duration {
        Duration::from_millis(self.wal_flush_interval_ms)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Retry policy for transient I/O failures
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.io_retry_attempts,
            Duration::from_millis(self.io_retry_backoff_ms),
        )
    }

    /// Reject invalid thresholds before any I/O is attempted
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(KeepError::Config(msg.to_string()))
        }

        if self.data_dir.as_os_str().is_empty() {
            return invalid("data_dir must not be empty");
        }
        if self.wal_segment_size_bytes == 0 {
            return invalid("wal_segment_size_bytes must be positive");
        }
        if self.max_entry_size_bytes == 0 {
            return invalid("max_entry_size_bytes must be positive");
        }
        if self.snapshot_retention_count == 0 {
            return invalid("snapshot_retention_count must be at least 1");
        }
        if self.snapshot_interval_ms == 0 {
            return invalid("snapshot_interval_ms must be positive");
        }
        if self.io_retry_attempts == 0 {
            return invalid("io_retry_attempts must be at least 1");
        }

        if self.persistence_mode == PersistenceMode::Async {
            if self.wal_flush_interval_ms == 0 {
                return invalid("wal_flush_interval_ms must be positive in async mode");
            }
            if self.async_queue_capacity == 0 {
                return invalid("async_queue_capacity must be positive in async mode");
            }
            if self.wal_buffer_size_bytes == 0 {
                return invalid("wal_buffer_size_bytes must be positive in async mode");
            }
        }

        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for WAL and snapshots)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the persistence mode
    pub fn persistence_mode(mut self, mode: PersistenceMode) -> Self {
        self.config.persistence_mode = mode;
        self
    }

    /// Set the WAL segment size threshold (in bytes)
    pub fn wal_segment_size_bytes(mut self, size: u64) -> Self {
        self.config.wal_segment_size_bytes = size;
        self
    }

    /// Set the async flush interval (in milliseconds)
    pub fn wal_flush_interval_ms(mut self, ms: u64) -> Self {
        self.config.wal_flush_interval_ms = ms;
        self
    }

    /// Set the async flush buffer threshold (in bytes)
    pub fn wal_buffer_size_bytes(mut self, size: usize) -> Self {
        self.config.wal_buffer_size_bytes = size;
        self
    }

    /// Set the maximum encoded entry size (in bytes)
    pub fn max_entry_size_bytes(mut self, size: u32) -> Self {
        self.config.max_entry_size_bytes = size;
        self
    }

    /// Set the async queue capacity
    pub fn async_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.async_queue_capacity = capacity;
        self
    }

    /// Set the behaviour when the async queue is full
    pub fn backpressure_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.config.backpressure_policy = policy;
        self
    }

    /// Set the snapshot interval (in milliseconds)
    pub fn snapshot_interval_ms(mut self, ms: u64) -> Self {
        self.config.snapshot_interval_ms = ms;
        self
    }

    /// Set how many snapshots are retained
    pub fn snapshot_retention_count(mut self, count: usize) -> Self {
        self.config.snapshot_retention_count = count;
        self
    }

    /// Enable or disable zstd compression of snapshot payloads
    pub fn snapshot_compression(mut self, enabled: bool) -> Self {
        self.config.snapshot_compression = enabled;
        self
    }

    /// Set how many sealed segments compaction always keeps
    pub fn compaction_keep_segments(mut self, count: usize) -> Self {
        self.config.compaction_keep_segments = count;
        self
    }

    /// Set the shutdown drain timeout (in milliseconds)
    pub fn shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.config.shutdown_timeout_ms = ms;
        self
    }

    /// Set the retry budget for transient I/O failures
    pub fn io_retry(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.config.io_retry_attempts = attempts;
        self.config.io_retry_backoff_ms = backoff_ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
