//! Tests for Recovery Manager
//!
//! These tests verify:
//! - Snapshot + WAL tail rebuilds the exact logged state
//! - Replay stops at the first bad frame and repairs the log
//! - Fallback across unusable snapshots
//! - Dry-run inspection never modifies files

use std::fs::{self, OpenOptions};
use std::io::Write;

use cachekeep::wal::segment_path;
use cachekeep::{Operation, RecoveryManager, SequenceGap};
use tempfile::TempDir;

use crate::common::*;

// =============================================================================
// Clean Recovery
// =============================================================================

#[test]
fn test_recover_empty_dir() {
    let temp = TempDir::new().unwrap();
    let (cache, result) = RecoveryManager::new(config(temp.path())).recover_mem().unwrap();

    assert!(cache.is_empty());
    assert_eq!(result.last_applied_sequence, 0);
    assert_eq!(result.next_sequence(), 1);
    assert!(result.snapshot.is_none());
    assert!(!result.degraded);
}

#[test]
fn test_recover_wal_only() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let mut ops = puts(1..=20);
    ops.push(Operation::delete("k03"));
    ops.push(Operation::put("k05", "changed"));

    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    log_all(&mut writer, &ops);
    drop(writer);

    let (cache, result) = RecoveryManager::new(config).recover_mem().unwrap();
    assert_eq!(cache.contents(), apply_all(&ops).contents());
    assert_eq!(cache.get(b"k03"), None);
    assert_eq!(cache.get(b"k05"), Some(b"changed".to_vec()));
    assert_eq!(result.replayed_entry_count, 22);
    assert_eq!(result.last_applied_sequence, 22);
    assert_eq!(result.corruption_boundary, None);
    assert!(!result.degraded);
}

#[test]
fn test_recover_snapshot_and_tail() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let ops = puts(1..=10);

    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    log_all(&mut writer, &ops);
    let meta = snapshot_of(&config, &ops[..6], 6);
    drop(writer);

    let (cache, result) = RecoveryManager::new(config).recover_mem().unwrap();
    assert_eq!(cache.contents(), apply_all(&ops).contents());
    assert_eq!(result.snapshot.as_ref().map(|s| s.path.clone()), Some(meta.path));
    assert_eq!(result.loaded_entry_count, 6);
    // Entries at or below the watermark are skipped
    assert_eq!(result.replayed_entry_count, 4);
    assert_eq!(result.last_applied_sequence, 10);
    assert_eq!(result.next_sequence(), 11);
}

#[test]
fn test_recover_snapshot_without_wal() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let ops = puts(1..=5);
    snapshot_of(&config, &ops, 5);

    let (cache, result) = RecoveryManager::new(config).recover_mem().unwrap();
    assert_eq!(cache.len(), 5);
    assert_eq!(result.replayed_entry_count, 0);
    assert_eq!(result.last_applied_sequence, 5);
    assert_eq!(result.next_sequence(), 6);
}

#[test]
fn test_recover_clear_and_expiry() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let ops = vec![
        Operation::put("a", "1"),
        Operation::Clear,
        Operation::put_expiring("b", "2", 4_000_000_000_000),
        Operation::put_expiring("c", "3", 1),
    ];

    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    log_all(&mut writer, &ops);
    drop(writer);

    let (cache, _) = RecoveryManager::new(config).recover_mem().unwrap();
    assert_eq!(cache.get(b"a"), None);
    assert_eq!(cache.get(b"b"), Some(b"2".to_vec()));
    // Already expired: not visible
    assert_eq!(cache.get(b"c"), None);
}

// =============================================================================
// Corruption
// =============================================================================

#[test]
fn test_corrupted_frame_stops_replay() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let ops = puts(1..=10);

    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    log_all(&mut writer, &ops);
    let segment = writer.active_segment_id().unwrap();
    drop(writer);

    // Flip a payload byte in frame 7
    let path = segment_path(&config.wal_dir(), segment);
    let offsets = frame_offsets(&path);
    let (_, frame7) = offsets[6];
    let mut bytes = fs::read(&path).unwrap();
    bytes[frame7 as usize + 20] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let (cache, result) = RecoveryManager::new(config.clone()).recover_mem().unwrap();
    assert_eq!(cache.contents(), apply_all(&ops[..6]).contents());
    assert_eq!(result.replayed_entry_count, 6);
    assert_eq!(result.last_applied_sequence, 6);
    assert_eq!(result.corruption_boundary, Some(6));
    assert_eq!(result.next_sequence(), 7);
    assert!(result.degraded);
    assert!(result.truncated);

    let point = result.corruption.unwrap();
    assert_eq!(point.segment_id, segment);
    assert_eq!(point.offset, frame7);

    // The segment was cut at the bad frame, so a second run is clean
    assert_eq!(fs::metadata(&path).unwrap().len(), frame7);
    let (again, second) = RecoveryManager::new(config).recover_mem().unwrap();
    assert_eq!(again.contents(), cache.contents());
    assert!(second.corruption.is_none());
    assert!(!second.degraded);
}

#[test]
fn test_torn_tail_is_truncated() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let ops = puts(1..=5);

    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    log_all(&mut writer, &ops);
    let segment = writer.active_segment_id().unwrap();
    drop(writer);

    // Half a frame at the end, as after a crash mid-write
    let path = segment_path(&config.wal_dir(), segment);
    let clean_len = fs::metadata(&path).unwrap().len();
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0x06, 0, 0, 0, 0, 0, 0, 0, 0xAB, 0xCD]).unwrap();
    drop(file);

    let (cache, result) = RecoveryManager::new(config).recover_mem().unwrap();
    assert_eq!(cache.len(), 5);
    assert_eq!(result.corruption_boundary, Some(5));
    assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
}

#[test]
fn test_segments_after_corruption_are_quarantined() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let ops = puts(1..=9);

    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    let first = writer.active_segment_id().unwrap();
    for chunk in ops.chunks(3) {
        log_all(&mut writer, chunk);
        writer.rotate().unwrap();
    }
    drop(writer);

    // Damage the second frame of the first segment
    let path = segment_path(&config.wal_dir(), first);
    let (_, frame2) = frame_offsets(&path)[1];
    let mut bytes = fs::read(&path).unwrap();
    bytes[frame2 as usize + 18] ^= 0x55;
    fs::write(&path, &bytes).unwrap();

    let (cache, result) = RecoveryManager::new(config.clone()).recover_mem().unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(result.corruption_boundary, Some(1));

    // Later segments are moved aside, never replayed or deleted
    assert_eq!(result.quarantined_segments.len(), 3);
    for moved in &result.quarantined_segments {
        assert!(moved.exists());
        assert!(moved.to_string_lossy().ends_with(".quarantined"));
    }
    let remaining = open_segments(&config).segments();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, first);
}

#[test]
fn test_sequence_gap_marks_degraded() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());

    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    log_all(&mut writer, &puts(1..=3));
    drop(writer);
    // Resume at 10: sequences 4..=9 were never logged
    let mut writer = open_writer(&config, &segments, 9);
    log_all(&mut writer, &puts(10..=11));
    drop(writer);

    let (cache, result) = RecoveryManager::new(config).recover_mem().unwrap();
    assert_eq!(cache.len(), 5);
    assert_eq!(result.last_applied_sequence, 11);
    assert!(result.degraded);
    assert!(result.corruption.is_none());

    let gap = result.first_gap.unwrap();
    assert_eq!(gap, SequenceGap { expected: 4, found: 10 });
    assert_eq!(gap.missing(), 6);
}

#[test]
fn test_only_first_gap_is_recorded() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());

    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    log_all(&mut writer, &puts(1..=2));
    drop(writer);
    let mut writer = open_writer(&config, &segments, 4);
    log_all(&mut writer, &puts(5..=5));
    drop(writer);
    let mut writer = open_writer(&config, &segments, 19);
    log_all(&mut writer, &puts(20..=20));
    drop(writer);

    let result = RecoveryManager::new(config).inspect().unwrap();
    assert_eq!(result.first_gap, Some(SequenceGap { expected: 3, found: 5 }));
    assert_eq!(result.last_applied_sequence, 20);
}

#[test]
fn test_gap_covered_by_snapshot_is_not_reported() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let ops = puts(1..=11);

    // The WAL lost 4..=9 but the snapshot holds everything through 9
    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    log_all(&mut writer, &ops[..3]);
    drop(writer);
    snapshot_of(&config, &ops[..9], 9);
    let mut writer = open_writer(&config, &segments, 9);
    log_all(&mut writer, &ops[9..]);
    drop(writer);

    let (cache, result) = RecoveryManager::new(config).recover_mem().unwrap();
    assert_eq!(cache.contents(), apply_all(&ops).contents());
    assert_eq!(result.first_gap, None);
    assert!(!result.degraded);
}

// =============================================================================
// Snapshot Fallback
// =============================================================================

#[test]
fn test_fallback_to_older_snapshot() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let ops = puts(1..=12);

    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    log_all(&mut writer, &ops);
    drop(writer);

    let older = snapshot_of(&config, &ops[..4], 4);
    let newer = snapshot_of(&config, &ops[..8], 8);
    let mut bytes = fs::read(&newer.path).unwrap();
    bytes[10] ^= 0xFF;
    fs::write(&newer.path, &bytes).unwrap();

    let (cache, result) = RecoveryManager::new(config).recover_mem().unwrap();
    assert_eq!(cache.contents(), apply_all(&ops).contents());
    assert_eq!(result.snapshot.map(|s| s.path), Some(older.path));
    assert_eq!(result.rejected_snapshots.len(), 1);
    assert_eq!(result.rejected_snapshots[0].path, newer.path);
    assert_eq!(result.replayed_entry_count, 8);
    assert!(!result.degraded);
}

#[test]
fn test_no_usable_snapshot() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let meta = snapshot_of(&config, &puts(1..=3), 3);
    fs::write(&meta.path, b"not a snapshot at all, just some bytes here").unwrap();

    let (cache, result) = RecoveryManager::new(config).recover_mem().unwrap();
    assert!(cache.is_empty());
    assert!(result.snapshot.is_none());
    assert_eq!(result.rejected_snapshots.len(), 1);
    assert!(result.degraded);
}

#[test]
fn test_leftover_temp_snapshot_is_removed() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    fs::create_dir_all(config.snapshot_dir()).unwrap();
    let leftover = config.snapshot_dir().join(".snapshot-1-1.tmp");
    fs::write(&leftover, b"partial").unwrap();

    RecoveryManager::new(config).recover_mem().unwrap();
    assert!(!leftover.exists());
}

// =============================================================================
// Inspect (dry run)
// =============================================================================

#[test]
fn test_inspect_does_not_modify_files() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());

    let segments = open_segments(&config);
    let mut writer = open_writer(&config, &segments, 0);
    let first = writer.active_segment_id().unwrap();
    log_all(&mut writer, &puts(1..=4));
    writer.rotate().unwrap();
    log_all(&mut writer, &puts(5..=6));
    drop(writer);

    let path = segment_path(&config.wal_dir(), first);
    let (_, frame3) = frame_offsets(&path)[2];
    let mut bytes = fs::read(&path).unwrap();
    bytes[frame3 as usize + 20] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let result = RecoveryManager::new(config.clone()).inspect().unwrap();
    assert_eq!(result.last_applied_sequence, 2);
    assert_eq!(result.corruption_boundary, Some(2));
    assert!(!result.truncated);
    assert_eq!(result.quarantined_segments.len(), 1);

    // Nothing moved or cut
    assert_eq!(fs::read(&path).unwrap(), bytes);
    assert!(result.quarantined_segments[0].exists());
}

#[test]
fn test_inspect_missing_dir() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp.path().join("absent"));

    let result = RecoveryManager::new(config.clone()).inspect().unwrap();
    assert_eq!(result.last_applied_sequence, 0);
    assert!(!config.wal_dir().exists());
}
