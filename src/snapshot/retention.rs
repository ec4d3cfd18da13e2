//! Snapshot retention
//!
//! Keeps the newest N snapshots. Older files are only removed after a newer
//! snapshot has been verified, and the last remaining snapshot is never
//! removed.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

use super::{list_snapshots, SnapshotMeta};

#[derive(Debug, Clone, Copy)]
pub struct SnapshotRetention {
    keep: usize,
}

impl SnapshotRetention {
    pub fn new(keep: usize) -> Self {
        Self { keep: keep.max(1) }
    }

    /// Delete snapshots beyond the newest `keep`
    ///
    /// `verified` must be a snapshot that was just verified loadable; if it
    /// is not among the retained set nothing is deleted. Deletion failures
    /// are logged and skipped.
    pub fn prune(&self, dir: &Path, verified: &SnapshotMeta) -> Result<Vec<PathBuf>> {
        let mut all = list_snapshots(dir)?;
        all.reverse();

        if all.len() <= self.keep {
            return Ok(Vec::new());
        }

        let retained = &all[..self.keep];
        if !retained.iter().any(|s| s.path == verified.path) {
            tracing::warn!(
                path = %verified.path.display(),
                "Verified snapshot is not among the newest; skipping retention"
            );
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for old in &all[self.keep..] {
            match fs::remove_file(&old.path) {
                Ok(()) => {
                    tracing::info!(
                        path = %old.path.display(),
                        watermark = old.watermark,
                        "Removed old snapshot"
                    );
                    removed.push(old.path.clone());
                }
                Err(e) => {
                    tracing::warn!(path = %old.path.display(), error = %e, "Could not remove old snapshot");
                }
            }
        }
        Ok(removed)
    }

    pub fn keep(&self) -> usize {
        self.keep
    }
}
