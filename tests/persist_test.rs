//! Tests for the on-disk result store.

use submitq::model::Outcome;
use submitq::persist::{ResultPersistence, SqliteStore};

fn succeeded(id: &str) -> Outcome {
    Outcome::Succeeded {
        external_id: id.into(),
        detail: Some(serde_json::json!({ "id": id })),
    }
}

#[test]
fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.db");

    {
        let store = SqliteStore::open(&path).unwrap();
        store
            .upsert_batch(
                "job",
                &[("k1".into(), succeeded("a")), ("k2".into(), succeeded("b"))],
            )
            .unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.counts("job").unwrap().succeeded, 2);
    let missing = store
        .unprocessed_keys("job", &["k1".into(), "k2".into(), "k3".into()])
        .unwrap();
    assert_eq!(missing, vec!["k3"]);
}

#[test]
fn reapplying_a_whole_batch_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.db");
    let store = SqliteStore::open(&path).unwrap();

    let batch: Vec<(String, Outcome)> = (0..50)
        .map(|i| (format!("k{i}"), succeeded(&format!("ext-{i}"))))
        .collect();

    store.upsert_batch("job", &batch).unwrap();
    // The crash-recovery path resubmits whole batches.
    store.upsert_batch("job", &batch).unwrap();

    assert_eq!(store.counts("job").unwrap().total(), 50);
}

#[test]
fn partially_overlapping_batches_only_add_new_keys() {
    let store = SqliteStore::in_memory().unwrap();

    let first: Vec<(String, Outcome)> = (0..10)
        .map(|i| (format!("k{i}"), succeeded("first")))
        .collect();
    let second: Vec<(String, Outcome)> = (5..15)
        .map(|i| (format!("k{i}"), succeeded("second")))
        .collect();

    store.upsert_batch("job", &first).unwrap();
    store.upsert_batch("job", &second).unwrap();

    assert_eq!(store.counts("job").unwrap().total(), 15);
}
