//! Tests for the background pool
//!
//! These tests verify:
//! - The scheduler takes snapshots on its own
//! - Verified snapshots trigger WAL compaction
//! - Snapshot retention through the coordinator

use cachekeep::snapshot;
use cachekeep::{Operation, PersistenceMode};
use tempfile::TempDir;

use crate::common::*;

#[test]
fn test_scheduled_snapshot() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Sync)
        .snapshot_interval_ms(50)
        .build();
    let (coordinator, _) = start(config.clone());
    coordinator.record(Operation::put("a", "1")).unwrap();

    assert!(eventually(|| {
        coordinator.health().last_snapshot_watermark == Some(1)
    }));
    assert!(!snapshot::list_snapshots(&config.snapshot_dir()).unwrap().is_empty());
}

#[test]
fn test_snapshot_triggers_compaction() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Sync)
        .wal_segment_size_bytes(512)
        .compaction_keep_segments(1)
        .build();
    let (coordinator, cache) = start(config.clone());

    for i in 0..200 {
        coordinator
            .record(Operation::put(format!("key{:03}", i % 50), format!("value{}", i)))
            .unwrap();
    }
    let before = coordinator.wal_segments().len();
    assert!(before > 3);

    let meta = coordinator.snapshot_now().unwrap();
    assert_eq!(meta.watermark, 200);

    // Active segment plus the retained sealed one
    assert!(eventually(|| coordinator.wal_segments().len() == 2));

    let expected = cache.contents();
    coordinator.shutdown();
    let (_, recovered) = start(config);
    assert_eq!(recovered.contents(), expected);
}

#[test]
fn test_retention_through_coordinator() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Sync)
        .snapshot_retention_count(2)
        .build();
    let (coordinator, _) = start(config.clone());

    for i in 0..4 {
        coordinator.record(Operation::put("k", format!("{}", i))).unwrap();
        coordinator.snapshot_now().unwrap();
    }

    let watermarks: Vec<u64> = snapshot::list_snapshots(&config.snapshot_dir())
        .unwrap()
        .iter()
        .map(|s| s.watermark)
        .collect();
    assert_eq!(watermarks, vec![3, 4]);
}
