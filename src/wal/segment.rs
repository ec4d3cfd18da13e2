//! Segment Manager
//!
//! Owns the set of WAL segment files.
//!
//! ## Responsibilities
//! - Discover existing segments on startup
//! - Create new segments with monotonically increasing ids
//! - Track which segment is active and which are sealed
//! - Refuse to delete the active segment or any leased segment
//! - Truncate / quarantine segments after a torn write

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{KeepError, Result};

use super::codec::EntryCodec;
use super::reader::SegmentReader;

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_EXTENSION: &str = "log";
const QUARANTINE_SUFFIX: &str = "quarantined";

/// Metadata about one segment file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: u64,
    pub path: PathBuf,

    /// Bytes on disk (as of the last flush for the active segment)
    pub size: u64,

    /// Highest sequence stored in the segment, `None` when empty
    pub max_sequence: Option<u64>,

    /// Sealed segments never receive further appends
    pub sealed: bool,
}

/// Manages WAL segment files
///
/// ## Concurrency:
/// - `catalog`: Protected by RwLock (writer updates, compactor/recovery read)
/// - `next_id` / `active_id`: Atomic counters
/// - `leases`: pin counts per segment id
/// - All methods use `&self`
pub struct SegmentManager {
    /// Directory where segments are stored
    dir: PathBuf,

    /// Known segments, ordered by id
    catalog: RwLock<BTreeMap<u64, SegmentInfo>>,

    /// Next id for a new segment
    next_id: AtomicU64,

    /// Id of the active segment (0 = none)
    active_id: AtomicU64,

    /// Read leases: segment id → number of holders
    leases: Mutex<HashMap<u64, usize>>,
}

impl SegmentManager {
    /// Open the segment directory
    ///
    /// On startup:
    /// 1. Create directory if it doesn't exist
    /// 2. Discover existing segment files
    /// 3. Scan each one for its size and highest valid sequence
    /// 4. Every discovered segment is sealed; the writer opens a fresh one
    pub fn open(dir: &Path, codec: Arc<dyn EntryCodec>, max_entry_size: u32) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut catalog = BTreeMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(id) = parse_segment_id(&path) else {
                continue;
            };

            let size = entry.metadata()?.len();
            let max_sequence = scan_max_sequence(&path, id, Arc::clone(&codec), max_entry_size)?;
            catalog.insert(
                id,
                SegmentInfo {
                    id,
                    path,
                    size,
                    max_sequence,
                    sealed: true,
                },
            );
        }

        let next_id = catalog.keys().next_back().map(|&id| id + 1).unwrap_or(1);

        tracing::debug!(
            dir = %dir.display(),
            segments = catalog.len(),
            next_id,
            "Opened WAL segment directory"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            catalog: RwLock::new(catalog),
            next_id: AtomicU64::new(next_id),
            active_id: AtomicU64::new(0),
            leases: Mutex::new(HashMap::new()),
        })
    }

    /// Create the next segment file and make it active
    ///
    /// The file is opened in append mode; the previous active segment (if
    /// any) must already have been sealed by the caller.
    pub fn create_segment(&self) -> Result<(u64, File)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let path = segment_path(&self.dir, id);

        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        sync_dir(&self.dir)?;

        self.catalog.write().insert(
            id,
            SegmentInfo {
                id,
                path,
                size: 0,
                max_sequence: None,
                sealed: false,
            },
        );
        self.active_id.store(id, Ordering::SeqCst);

        tracing::debug!(segment = id, "Created WAL segment");
        Ok((id, file))
    }

    /// Record the flushed state of the active segment
    pub fn update_active(&self, id: u64, size: u64, max_sequence: Option<u64>) {
        if let Some(info) = self.catalog.write().get_mut(&id) {
            info.size = size;
            info.max_sequence = max_sequence;
        }
    }

    /// Seal a segment: no further appends
    pub fn seal(&self, id: u64, size: u64, max_sequence: Option<u64>) {
        if let Some(info) = self.catalog.write().get_mut(&id) {
            info.size = size;
            info.max_sequence = max_sequence;
            info.sealed = true;
        }
        let _ = self
            .active_id
            .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst);
        tracing::debug!(segment = id, size, ?max_sequence, "Sealed WAL segment");
    }

    /// Id of the active segment, if one is open
    pub fn active_id(&self) -> Option<u64> {
        match self.active_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    /// All known segments, ascending by id
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.catalog.read().values().cloned().collect()
    }

    /// Sealed segments, ascending by id
    pub fn sealed_segments(&self) -> Vec<SegmentInfo> {
        self.catalog
            .read()
            .values()
            .filter(|s| s.sealed)
            .cloned()
            .collect()
    }

    pub fn segment_count(&self) -> usize {
        self.catalog.read().len()
    }

    /// Pin segments against deletion for the lifetime of the returned lease
    pub fn lease(&self, ids: &[u64]) -> ReadLease<'_> {
        let mut leases = self.leases.lock();
        for id in ids {
            *leases.entry(*id).or_insert(0) += 1;
        }
        ReadLease {
            manager: self,
            ids: ids.to_vec(),
        }
    }

    /// Pin every segment currently known
    pub fn lease_all(&self) -> ReadLease<'_> {
        let ids: Vec<u64> = self.catalog.read().keys().copied().collect();
        self.lease(&ids)
    }

    pub fn is_leased(&self, id: u64) -> bool {
        self.leases.lock().get(&id).copied().unwrap_or(0) > 0
    }

    /// Delete a sealed, unleased segment
    ///
    /// Returns the reclaimed size, or `None` when the segment is active,
    /// unsealed, leased or unknown.
    pub fn delete_segment(&self, id: u64) -> Result<Option<u64>> {
        if self.active_id() == Some(id) || self.is_leased(id) {
            return Ok(None);
        }

        let info = {
            let catalog = self.catalog.read();
            match catalog.get(&id) {
                Some(info) if info.sealed => info.clone(),
                _ => return Ok(None),
            }
        };

        match fs::remove_file(&info.path) {
            Ok(()) => {}
            // Already gone (e.g. an interrupted earlier compaction)
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.catalog.write().remove(&id);

        tracing::info!(segment = id, bytes = info.size, "Deleted WAL segment");
        Ok(Some(info.size))
    }

    /// Cut a sealed segment back to `len` bytes (drops a torn tail)
    pub fn truncate(&self, id: u64, len: u64, max_sequence: Option<u64>) -> Result<()> {
        let path = segment_path(&self.dir, id);
        let file = OpenOptions::new().write(true).open(&path)?;
        file.set_len(len)?;
        file.sync_all()?;

        if let Some(info) = self.catalog.write().get_mut(&id) {
            info.size = len;
            info.max_sequence = max_sequence;
        }

        tracing::warn!(segment = id, len, "Truncated WAL segment at torn write");
        Ok(())
    }

    /// Move an untrusted segment out of the log without deleting its bytes
    pub fn quarantine(&self, id: u64) -> Result<PathBuf> {
        if self.active_id() == Some(id) {
            return Err(KeepError::WalWrite(format!(
                "refusing to quarantine active segment {}",
                id
            )));
        }

        let from = segment_path(&self.dir, id);
        let to = from.with_extension(format!("{}.{}", SEGMENT_EXTENSION, QUARANTINE_SUFFIX));
        fs::rename(&from, &to)?;
        sync_dir(&self.dir)?;
        self.catalog.write().remove(&id);

        tracing::warn!(segment = id, path = %to.display(), "Quarantined WAL segment");
        Ok(to)
    }

    /// Get the directory path
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Pins a set of segments against deletion until dropped
pub struct ReadLease<'a> {
    manager: &'a SegmentManager,
    ids: Vec<u64>,
}

impl ReadLease<'_> {
    pub fn segment_ids(&self) -> &[u64] {
        &self.ids
    }
}

impl Drop for ReadLease<'_> {
    fn drop(&mut self) {
        let mut leases = self.manager.leases.lock();
        for id in &self.ids {
            if let Some(count) = leases.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    leases.remove(id);
                }
            }
        }
    }
}

// =============================================================================
// Naming Helpers
// =============================================================================

/// "wal-0000000042.log"
pub fn segment_file_name(id: u64) -> String {
    format!("{}{:010}.{}", SEGMENT_PREFIX, id, SEGMENT_EXTENSION)
}

/// Generate segment path given a directory and id
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(segment_file_name(id))
}

/// Parse segment id from filename
/// "wal-0000000042.log" → Some(42)
pub fn parse_segment_id(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != SEGMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let digits = stem.strip_prefix(SEGMENT_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Highest sequence of the valid prefix of a segment
fn scan_max_sequence(
    path: &Path,
    id: u64,
    codec: Arc<dyn EntryCodec>,
    max_entry_size: u32,
) -> Result<Option<u64>> {
    let mut reader = SegmentReader::open_with(path, id, codec, max_entry_size)?;
    let mut max = None;
    loop {
        match reader.next_entry() {
            Ok(Some(entry)) => max = Some(entry.sequence),
            Ok(None) | Err(KeepError::WalCorruption(_)) => return Ok(max),
            Err(e) => return Err(e),
        }
    }
}

/// fsync a directory so renames/creates inside it are durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}
