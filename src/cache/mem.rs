//! MemCache implementation
//!
//! Ordered cache on a persistent map. A snapshot view is an O(1) clone of the
//! map root; a write made while a view is alive copies only the path to the
//! changed leaf, so the append path never pays for the size of the cache.

use std::collections::BTreeMap;
use std::ops::Bound;

use imbl::OrdMap;
use parking_lot::RwLock;

use crate::wal::{now_millis, Operation};

use super::{CacheRecord, CacheStore};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Stored {
    value: Vec<u8>,
    expires_at: Option<i64>,
}

impl Stored {
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

type Map = OrdMap<Vec<u8>, Stored>;

/// In-memory cache
#[derive(Debug, Default)]
pub struct MemCache {
    data: RwLock<Map>,
}

impl MemCache {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a live value by key
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let now = now_millis();
        self.data
            .read()
            .get(key)
            .filter(|s| !s.is_expired(now))
            .map(|s| s.value.clone())
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, expires_at: Option<i64>) {
        self.data
            .write()
            .insert(key, Stored { value, expires_at });
    }

    /// Returns true if the key was present
    pub fn delete(&self, key: &[u8]) -> bool {
        let mut guard = self.data.write();
        if !guard.contains_key(key) {
            return false;
        }
        guard.remove(key).is_some()
    }

    pub fn clear(&self) {
        *self.data.write() = Map::new();
    }

    /// Number of stored records, expired ones included
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted copy of every live key/value pair
    pub fn contents(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.iterate_all().map(|r| (r.key, r.value)).collect()
    }
}

impl CacheStore for MemCache {
    fn apply_operation(&self, operation: &Operation) {
        match operation {
            Operation::Put {
                key,
                value,
                expires_at,
            } => self.put(key.clone(), value.clone(), *expires_at),
            Operation::Delete { key } => {
                self.delete(key);
            }
            Operation::Clear => self.clear(),
        }
    }

    fn iterate_all(&self) -> Box<dyn Iterator<Item = CacheRecord> + Send> {
        // Only the root clone happens under the lock
        let view = self.data.read().clone();
        Box::new(MemCacheIter {
            view,
            cursor: None,
            now: now_millis(),
        })
    }

    fn size(&self) -> usize {
        let now = now_millis();
        self.data
            .read()
            .values()
            .filter(|s| !s.is_expired(now))
            .count()
    }
}

/// Iterator over a frozen view of a [`MemCache`]
pub struct MemCacheIter {
    view: Map,
    /// Last key returned
    cursor: Option<Vec<u8>>,
    now: i64,
}

impl Iterator for MemCacheIter {
    type Item = CacheRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let lower = match &self.cursor {
                Some(key) => Bound::Excluded(key.as_slice()),
                None => Bound::Unbounded,
            };
            let (key, stored) = self
                .view
                .range::<_, [u8]>((lower, Bound::Unbounded))
                .next()?;
            self.cursor = Some(key.clone());

            if stored.is_expired(self.now) {
                continue;
            }
            return Some(CacheRecord {
                key: key.clone(),
                value: stored.value.clone(),
                expires_at: stored.expires_at,
            });
        }
    }
}
