//! Tests for Snapshot Store retention
//!
//! These tests verify:
//! - Only the newest N snapshots survive a successful snapshot
//! - Nothing is pruned when the new snapshot is not verified

use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use cachekeep::cache::CacheRecord;
use cachekeep::snapshot::{self, SnapshotMeta, SnapshotRetention, SnapshotStore};
use tempfile::TempDir;

fn record(i: u64) -> CacheRecord {
    CacheRecord {
        key: format!("k{}", i).into_bytes(),
        value: vec![i as u8; 16],
        expires_at: None,
    }
}

fn create(store: &SnapshotStore, watermark: u64) -> SnapshotMeta {
    let cancel = AtomicBool::new(false);
    store
        .create((0..watermark).map(record), watermark, &cancel)
        .unwrap()
}

fn watermarks(dir: &Path) -> Vec<u64> {
    snapshot::list_snapshots(dir)
        .unwrap()
        .iter()
        .map(|s| s.watermark)
        .collect()
}

#[test]
fn test_retention_keeps_newest() {
    let temp = TempDir::new().unwrap();
    let store = SnapshotStore::open(temp.path(), false, 2).unwrap();

    create(&store, 10);
    create(&store, 20);
    assert_eq!(watermarks(temp.path()), vec![10, 20]);

    let newest = create(&store, 30);
    assert_eq!(watermarks(temp.path()), vec![20, 30]);
    assert!(newest.path.exists());

    create(&store, 40);
    assert_eq!(watermarks(temp.path()), vec![30, 40]);
}

#[test]
fn test_retention_of_zero_keeps_one() {
    let temp = TempDir::new().unwrap();
    let store = SnapshotStore::open(temp.path(), true, 0).unwrap();

    create(&store, 1);
    create(&store, 2);
    assert_eq!(watermarks(temp.path()), vec![2]);
    assert_eq!(SnapshotRetention::new(0).keep(), 1);
}

#[test]
fn test_no_prune_when_verified_is_not_newest() {
    let temp = TempDir::new().unwrap();
    let store = SnapshotStore::open(temp.path(), false, 1).unwrap();
    let old = create(&store, 5);

    // A newer file appears that the caller never verified
    fs::write(temp.path().join("snapshot-1-99.snap"), b"garbage").unwrap();

    let pruned = SnapshotRetention::new(1).prune(temp.path(), &old).unwrap();
    assert!(pruned.is_empty());
    assert_eq!(watermarks(temp.path()), vec![5, 99]);
}

#[test]
fn test_newest_first() {
    let temp = TempDir::new().unwrap();
    let store = SnapshotStore::open(temp.path(), false, 3).unwrap();
    create(&store, 1);
    create(&store, 2);
    create(&store, 3);

    let order: Vec<u64> = store.newest_first().unwrap().iter().map(|s| s.watermark).collect();
    assert_eq!(order, vec![3, 2, 1]);
}
