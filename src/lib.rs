//! # cachekeep
//!
//! Crash-consistent persistence for an in-memory key-value cache:
//! - Segmented Write-Ahead Log (WAL) with CRC32-framed entries
//! - Checksummed point-in-time snapshots with retention
//! - Compaction of WAL segments subsumed by a snapshot
//! - Recovery that tolerates torn writes from an interrupted process
//! - Sync / async / disabled persistence modes behind one coordinator
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Cache (CacheStore)                      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ record(operation)
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  Persistence Coordinator                    │
//! │        (append mutex: sequence → WAL → cache apply)         │
//! └──────┬──────────────────────┬───────────────────────┬───────┘
//!        │                      │                       │
//!        ▼                      ▼                       ▼
//!  ┌───────────┐         ┌─────────────┐         ┌─────────────┐
//!  │    WAL    │         │  Snapshot   │────────►│  Compactor  │
//!  │ (segments)│         │ (scheduler) │ verified│             │
//!  └─────┬─────┘         └──────┬──────┘         └─────────────┘
//!        │                      │
//!        └──────────┬───────────┘
//!                   ▼
//!            ┌─────────────┐
//!            │  Recovery   │  (startup, before the cache serves)
//!            └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod wal;
pub mod cache;
pub mod snapshot;
pub mod compaction;
pub mod recovery;
pub mod coordinator;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use cache::{CacheRecord, CacheStore, MemCache};
pub use compaction::{CompactionReport, Compactor};
pub use config::{BackpressurePolicy, Config, ConfigBuilder, PersistenceMode};
pub use coordinator::{Ack, Coordinator, Health, HealthReport, ShutdownReport};
pub use error::{ErrorClass, KeepError, Result};
pub use recovery::{RecoveryManager, RecoveryResult, SequenceGap};
pub use snapshot::SnapshotMeta;
pub use wal::{Operation, WalEntry};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of cachekeep
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
