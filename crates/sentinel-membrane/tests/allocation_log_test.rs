//! Integration test: file-backed allocation log lifecycle.

use std::sync::Arc;

use sentinel_membrane::structured_log::validate_log_file;
use sentinel_membrane::{AllocationLog, AllocationTracker, StackBuilder};

#[test]
fn log_file_is_created_lazily_and_closed_explicitly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alloc.jsonl");
    let log = Arc::new(AllocationLog::to_file(&path));
    assert!(!path.exists(), "log must not open before the first record");

    let tracker = AllocationTracker::with_log(Arc::clone(&log));
    let mut first = StackBuilder::new(2, 4)
        .without_diagnostics()
        .tracker(tracker.clone())
        .build()
        .unwrap();
    let mut second = StackBuilder::new(1, 8)
        .without_diagnostics()
        .tracker(tracker.clone())
        .build()
        .unwrap();
    assert!(path.exists());
    assert_eq!(log.path(), Some(path.as_path()));

    for i in 0..5u32 {
        first.push(&i.to_le_bytes()).unwrap();
        second.push(&u64::from(i).to_le_bytes()).unwrap();
    }
    first.destroy().unwrap();
    drop(second);
    log.shutdown().unwrap();
    log.shutdown().unwrap();

    let (lines, errors) = validate_log_file(&path).unwrap();
    assert!(errors.is_empty(), "{errors:?}");

    let text = std::fs::read_to_string(&path).unwrap();
    let records: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), lines);
    assert_eq!(records.first().unwrap()["event"], "log_open");
    assert_eq!(records.last().unwrap()["event"], "log_close");

    let count = |event: &str| records.iter().filter(|r| r["event"] == event).count();
    assert_eq!(count("allocate"), 2);
    assert_eq!(count("free"), 2);
    // first: 2 -> 4 -> 8; second: 1 -> 2 -> 4 -> 8.
    assert_eq!(count("reallocate"), 5);
    assert_eq!(count("stack_resized"), 5);
    assert_eq!(count("stack_destroyed"), 2);

    // Every reallocate names both blocks.
    for r in records.iter().filter(|r| r["event"] == "reallocate") {
        assert!(r["old_address"].is_string());
        assert!(r["old_bytes"].is_number());
        assert!(r["stack_id"].is_number());
    }

    let snap = tracker.snapshot();
    assert_eq!(snap.live_regions, 0);
    assert_eq!(log.write_failures(), 0);
}

#[test]
fn unopenable_log_never_fails_the_stack() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(AllocationLog::to_file(dir.path().join("no/such/dir/alloc.jsonl")));
    let mut stack = StackBuilder::new(2, 1)
        .without_diagnostics()
        .tracker(AllocationTracker::with_log(Arc::clone(&log)))
        .build()
        .unwrap();
    stack.push(b"x").unwrap();
    stack.destroy().unwrap();
    assert!(!log.is_open());
    assert_eq!(log.write_failures(), 1);
}
