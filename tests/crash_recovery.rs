//! End-to-end crash-recovery scenarios (one of the testable properties):
//! a write that completes its WAL append but is interrupted before the
//! store is explicitly saved must still be durable on reopen.

use veloxdb_core::storage::VectorStore;
use veloxdb_core::{Database, DistanceMetric, VectorRecord};

#[test]
fn write_survives_reopen_without_explicit_save() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let mut store = VectorStore::open(dir.path(), 4).unwrap();
        let id = store.add(VectorRecord::new(vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        // Deliberately no `save()` / drop without an explicit flush, simulating
        // a process kill right after the WAL append but before a clean
        // shutdown truncates it.
        id
    };

    let reopened = VectorStore::open(dir.path(), 4).unwrap();
    let record = reopened.get(id).unwrap().unwrap();
    assert_eq!(record.values, vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn database_round_trips_across_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let db = Database::open(dir.path(), 3, DistanceMetric::Euclidean).unwrap();
        let id = db.add(vec![1.0, 1.0, 1.0], Default::default(), Some("hello".into()), None).unwrap();
        db.save().unwrap();
        id
    };

    let db = Database::open(dir.path(), 3, DistanceMetric::Euclidean).unwrap();
    let record = db.get(id).unwrap().unwrap();
    assert_eq!(record.text.as_deref(), Some("hello"));

    let results = db.search(&[1.0, 1.0, 1.0], 1, None).unwrap();
    assert_eq!(results[0].id, id);
}

#[test]
fn deletes_do_not_resurrect_on_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let (kept, removed) = {
        let db = Database::open(dir.path(), 2, DistanceMetric::Euclidean).unwrap();
        let kept = db.add(vec![0.0, 0.0], Default::default(), None, None).unwrap();
        let removed = db.add(vec![5.0, 5.0], Default::default(), None, None).unwrap();
        db.remove(removed).unwrap();
        db.save().unwrap();
        (kept, removed)
    };

    let db = Database::open(dir.path(), 2, DistanceMetric::Euclidean).unwrap();
    assert!(db.get(kept).unwrap().is_some());
    assert!(db.get(removed).unwrap().is_none());
}
