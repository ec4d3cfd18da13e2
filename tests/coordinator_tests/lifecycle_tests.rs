//! Tests for Coordinator lifecycle
//!
//! These tests verify:
//! - Operations are refused before start and after shutdown
//! - Configuration is validated before any I/O
//! - Shutdown reports what it confirmed

use std::sync::Arc;

use cachekeep::{Coordinator, KeepError, MemCache, Operation, PersistenceMode};
use tempfile::TempDir;

use crate::common::*;

#[test]
fn test_invalid_config_is_rejected() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("data");

    let config = builder(&data_dir, PersistenceMode::Sync)
        .wal_segment_size_bytes(0)
        .build();
    assert!(matches!(Coordinator::new(config), Err(KeepError::Config(_))));

    let config = builder(&data_dir, PersistenceMode::Async)
        .async_queue_capacity(0)
        .build();
    assert!(matches!(Coordinator::new(config), Err(KeepError::Config(_))));

    assert!(!data_dir.exists());
}

#[test]
fn test_record_before_start() {
    let temp = TempDir::new().unwrap();
    let coordinator = Coordinator::new(builder(temp.path(), PersistenceMode::Sync).build()).unwrap();

    assert!(!coordinator.is_running());
    assert!(matches!(
        coordinator.record(Operation::put("a", "1")),
        Err(KeepError::NotRunning)
    ));
    assert!(matches!(coordinator.flush(), Err(KeepError::NotRunning)));
}

#[test]
fn test_record_after_shutdown() {
    let temp = TempDir::new().unwrap();
    let (coordinator, _) = start(builder(temp.path(), PersistenceMode::Sync).build());
    coordinator.record(Operation::put("a", "1")).unwrap();

    let report = coordinator.shutdown();
    assert!(report.is_clean());
    assert!(!coordinator.is_running());

    assert!(matches!(
        coordinator.record(Operation::put("b", "2")),
        Err(KeepError::ShutDown)
    ));
    assert!(matches!(coordinator.snapshot_now(), Err(KeepError::ShutDown)));
    assert!(matches!(
        coordinator.start(Arc::new(MemCache::new())),
        Err(KeepError::ShutDown)
    ));

    // Shutting down twice is harmless
    assert_eq!(coordinator.shutdown().last_assigned_sequence, 0);
}

#[test]
fn test_double_start_is_rejected() {
    let temp = TempDir::new().unwrap();
    let (coordinator, _) = start(builder(temp.path(), PersistenceMode::Sync).build());

    assert!(matches!(
        coordinator.start(Arc::new(MemCache::new())),
        Err(KeepError::Config(_))
    ));
    assert!(coordinator.is_running());
}

#[test]
fn test_shutdown_report_sync() {
    let temp = TempDir::new().unwrap();
    let (coordinator, _) = start(builder(temp.path(), PersistenceMode::Sync).build());
    for i in 0..10 {
        coordinator.record(Operation::put(format!("k{}", i), "v")).unwrap();
    }

    let report = coordinator.shutdown();
    assert_eq!(report.last_assigned_sequence, 10);
    assert_eq!(report.durable_sequence, 10);
    assert_eq!(report.unflushed_through, None);
    assert!(!report.snapshot_discarded);
    assert!(report.timed_out_tasks.is_empty());
    assert!(report.wal_error.is_none());
}

#[test]
fn test_restart_reports_recovery() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Sync).build();

    {
        let (coordinator, _) = start(config.clone());
        for i in 0..5 {
            coordinator.record(Operation::put(format!("k{}", i), "v")).unwrap();
        }
        // Dropped: shuts down cleanly
    }

    let coordinator = Coordinator::new(config).unwrap();
    let cache = Arc::new(MemCache::new());
    let result = coordinator.start(cache.clone()).unwrap();

    assert_eq!(result.replayed_entry_count, 5);
    assert_eq!(result.last_applied_sequence, 5);
    assert!(!result.degraded);
    assert_eq!(cache.len(), 5);
    assert!(coordinator.health().status.is_healthy());
    assert_eq!(coordinator.health().last_durable_sequence, 5);
}

#[test]
fn test_lossy_recovery_degrades_health() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Sync).build();

    {
        let (coordinator, _) = start(config.clone());
        coordinator.record(Operation::put("a", "1")).unwrap();
        coordinator.snapshot_now().unwrap();
    }
    let snapshot = cachekeep::snapshot::list_snapshots(&config.snapshot_dir()).unwrap()[0]
        .path
        .clone();
    std::fs::write(&snapshot, b"damaged beyond repair, longer than a trailer").unwrap();

    let (coordinator, _) = start(config);
    assert!(!coordinator.health().status.is_healthy());

    // The next verified snapshot clears the condition
    coordinator.snapshot_now().unwrap();
    assert!(coordinator.health().status.is_healthy());
}
