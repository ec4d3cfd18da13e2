//! Error types for cachekeep
//!
//! Provides a unified error type for all persistence operations, plus the
//! classification used to decide whether a failure is retried, surfaced as a
//! health change, or treated as corruption.

use std::io;
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using KeepError
pub type Result<T> = std::result::Result<T, KeepError>;

/// Unified error type for cachekeep operations
#[derive(Debug, Error)]
pub enum KeepError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("WAL write failed: {0}")]
    WalWrite(String),

    // -------------------------------------------------------------------------
    // Snapshot Errors
    // -------------------------------------------------------------------------
    #[error("Snapshot corruption detected: {0}")]
    SnapshotCorruption(String),

    #[error("Snapshot aborted: {0}")]
    SnapshotAborted(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    /// Stored bytes could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An in-memory value could not be encoded for writing
    #[error("Encode error: {0}")]
    Encode(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Coordinator Errors
    // -------------------------------------------------------------------------
    #[error("Coordinator is not running")]
    NotRunning,

    #[error("Coordinator is shut down")]
    ShutDown,
}

impl From<bincode::Error> for KeepError {
    fn from(e: bincode::Error) -> Self {
        KeepError::Serialization(e.to_string())
    }
}

/// How a failure should be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary condition; retry with backoff
    Transient,

    /// Will not go away by retrying (disk full, permissions, ...)
    Persistent,

    /// Data on disk cannot be trusted; never retried
    Corruption,

    /// Invalid configuration; fail before touching the disk
    Config,
}

/// ENOSPC / EDQUOT on Linux
const RAW_DISK_FULL: i32 = 28;
const RAW_QUOTA_EXCEEDED: i32 = 122;

impl KeepError {
    /// Classify this error according to the persistence error taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            KeepError::Io(e) => classify_io(e),
            KeepError::WalCorruption(_)
            | KeepError::SnapshotCorruption(_)
            | KeepError::Serialization(_) => ErrorClass::Corruption,
            KeepError::Config(_) => ErrorClass::Config,
            KeepError::WalWrite(_)
            | KeepError::Encode(_)
            | KeepError::SnapshotAborted(_)
            | KeepError::NotRunning
            | KeepError::ShutDown => ErrorClass::Persistent,
        }
    }

    /// Shortcut for `class() == ErrorClass::Transient`
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Classify a raw I/O error
pub fn classify_io(e: &io::Error) -> ErrorClass {
    if matches!(e.raw_os_error(), Some(RAW_DISK_FULL) | Some(RAW_QUOTA_EXCEEDED)) {
        return ErrorClass::Persistent;
    }

    match e.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
            ErrorClass::Transient
        }
        io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData => ErrorClass::Corruption,
        _ => ErrorClass::Persistent,
    }
}

/// Retry policy for transient I/O failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,

    /// Delay before the second attempt; doubles on every retry
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `op`, retrying while it fails with a transient error
    ///
    /// Persistent and corruption errors are returned on the first failure.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut delay = self.backoff;
        let mut attempt = 1;

        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    tracing::warn!(
                        operation = what,
                        attempt,
                        error = %e,
                        "Transient I/O failure, retrying in {:?}",
                        delay
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(10))
    }
}
