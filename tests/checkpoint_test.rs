//! Tests for the durable checkpoint store.

use submitq::checkpoint::CheckpointStore;
use submitq::model::Checkpoint;

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("k{i}")).collect()
}

#[test]
fn save_then_load_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();

    let mut checkpoint = Checkpoint::new("job-1", keys(10));
    checkpoint.apply_committed(&keys(10)[..3], 2, 1);
    store.save(&checkpoint).unwrap();

    let loaded = store.load("job-1").unwrap().expect("snapshot present");
    assert_eq!(loaded.job_id, "job-1");
    assert_eq!(loaded.total_items, 10);
    assert_eq!(loaded.processed_count, 3);
    assert_eq!(loaded.succeeded_count, 2);
    assert_eq!(loaded.failed_count, 1);
    assert_eq!(loaded.remaining_item_keys, keys(10)[3..].to_vec());
}

#[test]
fn load_missing_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    assert!(store.load("nope").unwrap().is_none());
}

#[test]
fn corrupt_snapshot_is_an_error_not_a_fresh_start() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();

    std::fs::write(dir.path().join("job-1.json"), b"{ half a snapsh").unwrap();
    assert!(store.load("job-1").is_err());
}

#[test]
fn save_replaces_the_snapshot_and_leaves_no_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();

    let mut checkpoint = Checkpoint::new("job-1", keys(4));
    store.save(&checkpoint).unwrap();
    checkpoint.apply_committed(&keys(4)[..2], 2, 0);
    store.save(&checkpoint).unwrap();

    let loaded = store.load("job-1").unwrap().unwrap();
    assert_eq!(loaded.processed_count, 2);
    assert!(!dir.path().join("job-1.json.tmp").exists());
}

#[test]
fn archive_retires_the_live_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();

    store.save(&Checkpoint::new("job-1", keys(2))).unwrap();
    store.archive("job-1").unwrap();

    assert!(store.load("job-1").unwrap().is_none());
    assert!(dir.path().join("job-1.json.done").exists());
}

#[test]
fn archive_of_a_missing_snapshot_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path()).unwrap();
    store.archive("never-saved").unwrap();
}
