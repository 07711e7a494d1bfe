//! Durability and index-consistency properties of the WAL-fronted shard
//! store, exercised through full close/reopen cycles on disk.

use tempfile::tempdir;

use timemachine::job::Job;
use timemachine::store::{ShardStore, StoreError};
use timemachine::wal::{LogEntry, Wal, WalOptions};

fn job(id: &str, trigger_ms: i64) -> Job {
    Job {
        id: id.into(),
        trigger_ms,
        meta: serde_json::json!({"payload": id}),
        route: "R1".into(),
    }
}

fn open(dir: &std::path::Path) -> ShardStore {
    ShardStore::open(
        1,
        dir.join("1.db"),
        dir.join("1"),
        WalOptions::default(),
    )
    .unwrap()
}

#[test]
fn every_job_has_exactly_one_bucket_entry() {
    let dir = tempdir().unwrap();
    let store = open(dir.path());

    // Writes, updates across minutes, deletes.
    store.set("jobs", &job("a", 60_000)).unwrap();
    store.set("jobs", &job("b", 65_000)).unwrap();
    store.set("jobs", &job("b", 125_000)).unwrap();
    store.set("jobs", &job("c", 120_000)).unwrap();
    store.delete("jobs", "c").unwrap();

    // Bucket contents resolve exactly to the stored jobs, in their current
    // minute only.
    let minute1: Vec<String> = store
        .fetch_bucket(1)
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(minute1, vec!["a".to_string()]);

    let minute2: Vec<String> = store
        .fetch_bucket(2)
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(minute2, vec!["b".to_string()]);

    assert!(store.get("jobs", "a").is_ok());
    assert_eq!(store.get("jobs", "b").unwrap().trigger_ms, 125_000);
    assert!(matches!(
        store.get("jobs", "c"),
        Err(StoreError::KeyNotFound)
    ));
}

#[test]
fn replaying_the_wal_converges_to_the_pre_crash_state() {
    let dir = tempdir().unwrap();

    // Build up state normally and remember it.
    {
        let store = open(dir.path());
        store.set("jobs", &job("a", 60_000)).unwrap();
        store.set("jobs", &job("b", 120_000)).unwrap();
        store.set("jobs", &job("a", 180_000)).unwrap();
        store.delete("jobs", "b").unwrap();
        store.close().unwrap();
    }

    // Simulate an engine wipe (crash before any transaction landed): keep
    // the WAL, delete the engine file, and reopen.
    std::fs::remove_file(dir.path().join("1.db")).unwrap();
    let store = open(dir.path());

    assert_eq!(store.get("jobs", "a").unwrap().trigger_ms, 180_000);
    assert!(store.get("jobs", "b").is_err());
    assert!(store.fetch_bucket(1).unwrap().is_empty());
    assert!(store.fetch_bucket(2).unwrap().is_empty());
    assert_eq!(store.fetch_bucket(3).unwrap().len(), 1);
}

#[test]
fn replay_is_idempotent_over_duplicate_applies() {
    let dir = tempdir().unwrap();

    {
        let store = open(dir.path());
        store.set("jobs", &job("a", 60_000)).unwrap();
        store.delete("jobs", "a").unwrap();
        store.set("jobs", &job("a", 120_000)).unwrap();
        store.close().unwrap();
    }

    // Force a full re-apply by resetting the applied offset marker.
    {
        let conn = rusqlite::Connection::open(dir.path().join("1.db")).unwrap();
        conn.execute("DELETE FROM meta WHERE k = 'applied_offset'", [])
            .unwrap();
    }

    let store = open(dir.path());
    assert_eq!(store.get("jobs", "a").unwrap().trigger_ms, 120_000);
    assert_eq!(store.fetch_bucket(2).unwrap().len(), 1);
    assert!(store.fetch_bucket(1).unwrap().is_empty());
}

#[test]
fn wal_replay_offsets_match_store_offsets() {
    let dir = tempdir().unwrap();
    {
        let store = open(dir.path());
        assert_eq!(store.set("jobs", &job("x", 60_000)).unwrap(), 0);
        assert_eq!(store.set("jobs", &job("y", 60_000)).unwrap(), 1);
        assert_eq!(store.delete("jobs", "x").unwrap(), 2);
        store.close().unwrap();
    }

    let mut wal = Wal::open(dir.path().join("1"), WalOptions::default()).unwrap();
    let mut records = Vec::new();
    wal.replay(0, |offset, bytes| {
        records.push((offset, LogEntry::from_bytes(bytes).unwrap()));
        Ok(())
    })
    .unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].0, 0);
    assert_eq!(records[2].0, 2);
    assert_eq!(records[1].1.collection, "jobs");
}
