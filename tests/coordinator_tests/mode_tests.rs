//! Tests for the append path in each persistence mode
//!
//! These tests verify:
//! - Sync acks are durable before returning and survive a crash
//! - Async acks are buffered and confirmed by flush/shutdown
//! - Disabled mode never touches the disk
//! - Queue-full handling under the signal-degraded policy

use std::fs;

use cachekeep::{
    Ack, BackpressurePolicy, CacheStore, Health, KeepError, MemCache, Operation, PersistenceMode,
};
use tempfile::TempDir;

use crate::common::*;

// =============================================================================
// Sync Mode
// =============================================================================

#[test]
fn test_sync_acks_are_durable() {
    let temp = TempDir::new().unwrap();
    let (coordinator, cache) = start(builder(temp.path(), PersistenceMode::Sync).build());

    assert_eq!(coordinator.record(Operation::put("a", "1")).unwrap(), Ack::Durable(1));
    assert_eq!(coordinator.record(Operation::put("b", "2")).unwrap(), Ack::Durable(2));
    assert_eq!(coordinator.record(Operation::delete("a")).unwrap(), Ack::Durable(3));

    assert_eq!(cache.get(b"a"), None);
    assert_eq!(cache.get(b"b"), Some(b"2".to_vec()));

    let health = coordinator.health();
    assert_eq!(health.status, Health::Healthy);
    assert_eq!(health.last_durable_sequence, 3);
    assert_eq!(health.last_assigned_sequence, 3);
}

#[test]
fn test_sync_put_survives_crash() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Sync).build();

    let (coordinator, _) = start(config.clone());
    coordinator.record(Operation::put("a", "1")).unwrap();
    crash(coordinator);

    let (coordinator, cache) = start(config);
    assert_eq!(cache.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(coordinator.record(Operation::put("b", "2")).unwrap(), Ack::Durable(2));
}

#[test]
fn test_snapshot_then_delete_survives_crash() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Sync).build();

    let (coordinator, _) = start(config.clone());
    coordinator.record(Operation::put("a", "1")).unwrap();
    coordinator.record(Operation::put("b", "2")).unwrap();
    let meta = coordinator.snapshot_now().unwrap();
    assert_eq!(meta.watermark, 2);
    coordinator.record(Operation::delete("a")).unwrap();
    crash(coordinator);

    let coordinator = cachekeep::Coordinator::new(config).unwrap();
    let cache = std::sync::Arc::new(MemCache::new());
    let result = coordinator.start(cache.clone()).unwrap();

    assert_eq!(cache.get(b"a"), None);
    assert_eq!(cache.get(b"b"), Some(b"2".to_vec()));
    assert_eq!(result.loaded_entry_count, 2);
    assert_eq!(result.replayed_entry_count, 1);
    assert_eq!(result.next_sequence(), 4);
}

#[test]
fn test_oversized_entry_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Sync)
        .max_entry_size_bytes(64)
        .build();
    let (coordinator, cache) = start(config);

    let result = coordinator.record(Operation::put("big", vec![0u8; 100]));
    assert!(matches!(result, Err(KeepError::WalWrite(_))));
    assert!(cache.is_empty());

    // The sequence was not consumed
    assert_eq!(coordinator.record(Operation::put("a", "1")).unwrap(), Ack::Durable(1));
}

#[test]
fn test_sync_entry_at_size_limit() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Sync)
        .max_entry_size_bytes(64)
        .build();
    let (coordinator, _) = start(config.clone());

    // Key plus value exactly at the limit
    assert_eq!(
        coordinator.record(Operation::put("", vec![7u8; 64])).unwrap(),
        Ack::Durable(1)
    );
    assert_eq!(
        coordinator.record(Operation::put("k", vec![7u8; 63])).unwrap(),
        Ack::Durable(2)
    );
    assert!(matches!(
        coordinator.record(Operation::put("k", vec![7u8; 64])),
        Err(KeepError::WalWrite(_))
    ));
    assert_eq!(coordinator.health().status, Health::Healthy);
    crash(coordinator);

    let (_, recovered) = start(config);
    assert_eq!(recovered.get(b""), Some(vec![7u8; 64]));
    assert_eq!(recovered.get(b"k"), Some(vec![7u8; 63]));
}

// =============================================================================
// Async Mode
// =============================================================================

#[test]
fn test_async_acks_are_buffered() {
    let temp = TempDir::new().unwrap();
    let (coordinator, cache) = start(builder(temp.path(), PersistenceMode::Async).build());

    for i in 1..=100u64 {
        let ack = coordinator
            .record(Operation::put(format!("k{}", i), format!("v{}", i)))
            .unwrap();
        assert_eq!(ack, Ack::Buffered(i));
    }
    assert_eq!(cache.size(), 100);

    assert_eq!(coordinator.flush().unwrap(), 100);
    assert_eq!(coordinator.health().last_durable_sequence, 100);
}

#[test]
fn test_async_entry_at_size_limit() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Async)
        .max_entry_size_bytes(64)
        .build();
    let (coordinator, _) = start(config.clone());

    assert_eq!(
        coordinator.record(Operation::put("", vec![7u8; 64])).unwrap(),
        Ack::Buffered(1)
    );
    assert!(matches!(
        coordinator.record(Operation::put("k", vec![7u8; 64])),
        Err(KeepError::WalWrite(_))
    ));

    // The worker logs what the append path accepted
    assert_eq!(coordinator.flush().unwrap(), 1);
    let health = coordinator.health();
    assert_eq!(health.status, Health::Healthy);
    assert_eq!(health.unlogged_through, None);
    assert_eq!(health.last_durable_sequence, 1);

    coordinator.shutdown();
    let (_, recovered) = start(config);
    assert_eq!(recovered.get(b""), Some(vec![7u8; 64]));
}

#[test]
fn test_async_shutdown_drains_queue() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Async)
        .wal_flush_interval_ms(60_000)
        .build();

    let (coordinator, cache) = start(config.clone());
    for i in 0..500 {
        coordinator
            .record(Operation::put(format!("k{}", i), format!("v{}", i)))
            .unwrap();
    }
    let expected = cache.contents();

    let report = coordinator.shutdown();
    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.last_assigned_sequence, 500);
    assert_eq!(report.durable_sequence, 500);

    let (_, recovered) = start(config);
    assert_eq!(recovered.contents(), expected);
}

#[test]
fn test_signal_degraded_when_queue_full() {
    let temp = TempDir::new().unwrap();
    let config = builder(temp.path(), PersistenceMode::Async)
        .async_queue_capacity(1)
        .wal_buffer_size_bytes(1)
        .backpressure_policy(BackpressurePolicy::SignalDegraded)
        .build();
    let (coordinator, cache) = start(config.clone());

    // Every append forces an fsync, so a tight loop overruns the queue
    let mut unlogged = None;
    for i in 0..20_000u64 {
        let ack = coordinator
            .record(Operation::put(format!("k{}", i % 64), i.to_string()))
            .unwrap();
        if let Ack::Unlogged(seq) = ack {
            unlogged = Some(seq);
            break;
        }
    }
    let seq = unlogged.expect("queue never filled");

    let health = coordinator.health();
    let covered = health.last_snapshot_watermark.map_or(false, |w| w >= seq);
    assert!(covered || matches!(health.status, Health::Degraded { .. }));

    // A verified snapshot covering the entry restores durability
    let meta = coordinator.snapshot_now().unwrap();
    assert!(meta.watermark >= seq);
    let health = coordinator.health();
    assert_eq!(health.unlogged_through, None);
    assert_eq!(health.status, Health::Healthy);

    let expected = cache.contents();
    coordinator.shutdown();
    let (_, recovered) = start(config);
    assert_eq!(recovered.contents(), expected);
}

// =============================================================================
// Disabled Mode
// =============================================================================

#[test]
fn test_disabled_mode_is_memory_only() {
    let temp = TempDir::new().unwrap();
    let data_dir = temp.path().join("data");
    let (coordinator, cache) = start(builder(&data_dir, PersistenceMode::Disabled).build());
    assert_eq!(coordinator.mode(), PersistenceMode::Disabled);

    assert_eq!(coordinator.record(Operation::put("a", "1")).unwrap(), Ack::Volatile);
    assert_eq!(cache.get(b"a"), Some(b"1".to_vec()));
    assert_eq!(coordinator.flush().unwrap(), 0);
    assert!(matches!(coordinator.snapshot_now(), Err(KeepError::Config(_))));
    assert!(coordinator.wal_segments().is_empty());

    let report = coordinator.shutdown();
    assert!(report.is_clean());
    assert!(!data_dir.exists());
    assert!(fs::read_dir(temp.path()).unwrap().next().is_none());
}
