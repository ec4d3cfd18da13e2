//! Cache Module
//!
//! The boundary between the persistence layer and the cache it protects.
//!
//! ## Responsibilities
//! - `CacheStore`: the capability the persistence layer consumes
//!   (apply an operation, iterate a stable view, report size)
//! - `MemCache`: a reference in-memory implementation used by recovery,
//!   the CLI, tests and benchmarks
//!
//! ## Stable Views
//! Snapshot creation needs an iterator over the cache "as of" the watermark
//! while mutations keep flowing. `MemCache` keeps a persistent `OrdMap`: an
//! iterator holds a clone of the root, and later writes copy only the nodes
//! they touch, so the iterator keeps walking the old version.

mod mem;

pub use mem::{MemCache, MemCacheIter};

use crate::wal::Operation;

/// A live record as seen by the snapshot writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,

    /// Absolute expiry in unix millis
    pub expires_at: Option<i64>,
}

impl From<CacheRecord> for Operation {
    fn from(record: CacheRecord) -> Self {
        Operation::Put {
            key: record.key,
            value: record.value,
            expires_at: record.expires_at,
        }
    }
}

/// Capability the persistence layer needs from the cache
pub trait CacheStore: Send + Sync {
    /// Apply a logged operation; must be idempotent under replay
    fn apply_operation(&self, operation: &Operation);

    /// Lazy iteration over a point-in-time view of every live record
    ///
    /// Obtaining the iterator must be cheap; iterating it must not block
    /// concurrent mutations.
    fn iterate_all(&self) -> Box<dyn Iterator<Item = CacheRecord> + Send>;

    /// Number of live records
    fn size(&self) -> usize;
}
