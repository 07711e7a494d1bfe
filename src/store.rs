//! Per-shard job storage: a WAL-fronted embedded B-tree engine holding two
//! logical key spaces.
//!
//! | Space      | Key                    | Value                  |
//! |------------|------------------------|------------------------|
//! | `jobs`     | `(collection, job_id)` | encoded Job            |
//! | `schedule` | `(minute, composite)`  | stringified trigger_ms |
//!
//! where `composite` is `{collection}_{job_id}`. Every mutation is appended
//! to the shard's WAL first and then applied to the engine inside a single
//! transaction that touches both spaces, so the collection space and the
//! schedule index can never diverge. On open, records past the engine's
//! `applied_offset` are replayed idempotently.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::dht::ShardId;
use crate::job::{split_bucket_key, Job, JobError};
use crate::wal::{LogEntry, LogOp, Wal, WalError, WalOptions};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found")]
    KeyNotFound,

    #[error("bucket not found")]
    BucketNotFound,

    #[error("shard store disabled after a wal append failure; restart to recover")]
    Poisoned,

    #[error("invalid composite bucket key: {0}")]
    InvalidBucketKey(String),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error("engine error: {0}")]
    Engine(#[from] rusqlite::Error),

    #[error(transparent)]
    Job(#[from] JobError),
}

struct Inner {
    conn: Connection,
    wal: Wal,

    /// Set on the first WAL append failure. Losing the log makes further
    /// writes unrecoverable, so the shard refuses them until restart.
    poisoned: bool,
}

/// One shard's durable store. Mutations are serialised by the interior lock;
/// the WAL append happens before the engine transaction.
pub struct ShardStore {
    shard_id: ShardId,
    inner: Mutex<Inner>,
}

impl ShardStore {
    /// Opens the engine at `db_path` and the WAL under `wal_dir`, then
    /// replays any records the engine has not yet applied.
    pub fn open(
        shard_id: ShardId,
        db_path: impl AsRef<Path>,
        wal_dir: impl AsRef<Path>,
        wal_opts: WalOptions,
    ) -> Result<ShardStore, StoreError> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                 collection TEXT NOT NULL,
                 id         TEXT NOT NULL,
                 body       BLOB NOT NULL,
                 PRIMARY KEY (collection, id)
             );
             CREATE TABLE IF NOT EXISTS schedule (
                 minute     INTEGER NOT NULL,
                 key        TEXT NOT NULL,
                 trigger_ms TEXT NOT NULL,
                 PRIMARY KEY (minute, key)
             );
             CREATE TABLE IF NOT EXISTS meta (
                 k TEXT PRIMARY KEY,
                 v INTEGER NOT NULL
             );",
        )?;

        let wal = Wal::open(wal_dir, wal_opts)?;
        let mut inner = Inner {
            conn,
            wal,
            poisoned: false,
        };

        let applied = applied_offset(&inner.conn)?;
        let latest = inner.wal.latest_offset();
        if latest > applied {
            info!(
                shard = shard_id,
                applied, latest, "replaying wal records missed by the engine"
            );
            replay_into_engine(&mut inner, applied + 1)?;
        }

        debug!(shard = shard_id, "opened shard store");
        Ok(ShardStore {
            shard_id,
            inner: Mutex::new(inner),
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Reads one job. `BucketNotFound` means the collection has never been
    /// written on this shard; `KeyNotFound` means the collection exists but
    /// the id does not.
    pub fn get(&self, collection: &str, job_id: &str) -> Result<Job, StoreError> {
        let inner = self.inner.lock().unwrap();
        let body: Option<Vec<u8>> = inner
            .conn
            .query_row(
                "SELECT body FROM jobs WHERE collection = ?1 AND id = ?2",
                params![collection, job_id],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(by) => Ok(Job::from_bytes(&by)?),
            None => {
                let exists: Option<i64> = inner
                    .conn
                    .query_row(
                        "SELECT 1 FROM jobs WHERE collection = ?1 LIMIT 1",
                        params![collection],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    Err(StoreError::KeyNotFound)
                } else {
                    Err(StoreError::BucketNotFound)
                }
            }
        }
    }

    /// Writes the collection entry and the minute-bucket index entry in one
    /// transaction, WAL first. Returns the WAL offset of the mutation.
    pub fn set(&self, collection: &str, job: &Job) -> Result<i64, StoreError> {
        let by = job.to_bytes()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.poisoned {
            return Err(StoreError::Poisoned);
        }

        let entry = LogEntry::set(collection, by.clone());
        let offset = match inner.wal.append(&entry) {
            Ok(offset) => offset,
            Err(e) => {
                error!(shard = self.shard_id, error = %e, "wal append failed; disabling shard writes");
                inner.poisoned = true;
                return Err(e.into());
            }
        };
        crate::metrics::WAL_APPENDS_TOTAL.inc();

        apply_set(&mut inner.conn, collection, job, &by, offset)?;
        Ok(offset)
    }

    /// Removes a job from both spaces in one transaction, WAL first.
    /// Fails with `KeyNotFound` if the job is absent.
    pub fn delete(&self, collection: &str, job_id: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.poisoned {
            return Err(StoreError::Poisoned);
        }

        let entry = LogEntry::delete(collection, job_id);
        let offset = match inner.wal.append(&entry) {
            Ok(offset) => offset,
            Err(e) => {
                error!(shard = self.shard_id, error = %e, "wal append failed; disabling shard writes");
                inner.poisoned = true;
                return Err(e.into());
            }
        };
        crate::metrics::WAL_APPENDS_TOTAL.inc();

        let removed = apply_delete(&mut inner.conn, collection, job_id, offset)?;
        if !removed {
            return Err(StoreError::KeyNotFound);
        }
        Ok(offset)
    }

    /// All jobs scheduled in the given minute bucket. Index entries whose
    /// collection has since been removed are skipped.
    pub fn fetch_bucket(&self, minute: i64) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().unwrap();

        let mut stmt = inner
            .conn
            .prepare("SELECT key FROM schedule WHERE minute = ?1 ORDER BY key")?;
        let keys: Vec<String> = stmt
            .query_map(params![minute], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut jobs = Vec::with_capacity(keys.len());
        for key in keys {
            let Some((collection, job_id)) = split_bucket_key(&key) else {
                return Err(StoreError::InvalidBucketKey(key));
            };
            let body: Option<Vec<u8>> = inner
                .conn
                .query_row(
                    "SELECT body FROM jobs WHERE collection = ?1 AND id = ?2",
                    params![collection, job_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(by) = body {
                jobs.push(Job::from_bytes(&by)?);
            }
        }
        Ok(jobs)
    }

    /// Offset of the most recent WAL record for this shard.
    pub fn latest_offset(&self) -> i64 {
        self.inner.lock().unwrap().wal.latest_offset()
    }

    /// Flushes the WAL to disk and closes the engine.
    pub fn close(self) -> Result<(), StoreError> {
        let inner = self.inner.into_inner().unwrap();
        inner.wal.close()?;
        // Connection closes on drop; surface errors explicitly instead.
        inner
            .conn
            .close()
            .map_err(|(_, e)| StoreError::Engine(e))?;
        debug!(shard = self.shard_id, "closed shard store");
        Ok(())
    }
}

fn applied_offset(conn: &Connection) -> Result<i64, StoreError> {
    let v: Option<i64> = conn
        .query_row(
            "SELECT v FROM meta WHERE k = 'applied_offset'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(v.unwrap_or(-1))
}

/// Upserts a job into both spaces and advances `applied_offset`, all in one
/// transaction. Replacing an existing job also clears its old index entry so
/// a job never owns two bucket slots.
fn apply_set(
    conn: &mut Connection,
    collection: &str,
    job: &Job,
    body: &[u8],
    offset: i64,
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;

    let old: Option<Vec<u8>> = tx
        .query_row(
            "SELECT body FROM jobs WHERE collection = ?1 AND id = ?2",
            params![collection, job.id],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(old_by) = old {
        let old_job = Job::from_bytes(&old_by)?;
        tx.execute(
            "DELETE FROM schedule WHERE minute = ?1 AND key = ?2",
            params![old_job.minute_bucket(), old_job.bucket_key(collection)],
        )?;
    }

    tx.execute(
        "INSERT OR REPLACE INTO jobs (collection, id, body) VALUES (?1, ?2, ?3)",
        params![collection, job.id, body],
    )?;
    tx.execute(
        "INSERT OR REPLACE INTO schedule (minute, key, trigger_ms) VALUES (?1, ?2, ?3)",
        params![
            job.minute_bucket(),
            job.bucket_key(collection),
            job.trigger_ms.to_string()
        ],
    )?;
    tx.execute(
        "INSERT OR REPLACE INTO meta (k, v) VALUES ('applied_offset', ?1)",
        params![offset],
    )?;

    tx.commit()?;
    Ok(())
}

/// Removes a job from both spaces and advances `applied_offset`. Returns
/// whether the job existed.
fn apply_delete(
    conn: &mut Connection,
    collection: &str,
    job_id: &str,
    offset: i64,
) -> Result<bool, StoreError> {
    let tx = conn.transaction()?;

    let old: Option<Vec<u8>> = tx
        .query_row(
            "SELECT body FROM jobs WHERE collection = ?1 AND id = ?2",
            params![collection, job_id],
            |row| row.get(0),
        )
        .optional()?;

    let removed = match old {
        Some(old_by) => {
            let old_job = Job::from_bytes(&old_by)?;
            tx.execute(
                "DELETE FROM jobs WHERE collection = ?1 AND id = ?2",
                params![collection, job_id],
            )?;
            tx.execute(
                "DELETE FROM schedule WHERE minute = ?1 AND key = ?2",
                params![old_job.minute_bucket(), old_job.bucket_key(collection)],
            )?;
            true
        }
        None => false,
    };

    tx.execute(
        "INSERT OR REPLACE INTO meta (k, v) VALUES ('applied_offset', ?1)",
        params![offset],
    )?;
    tx.commit()?;
    Ok(removed)
}

/// Replays WAL records from `from` into the engine. Deletes of absent keys
/// are tolerated so the replay is idempotent.
fn replay_into_engine(inner: &mut Inner, from: i64) -> Result<(), StoreError> {
    let conn = &mut inner.conn;
    let mut first_err = None;
    inner.wal.replay(from, |offset, bytes| {
        let entry = match LogEntry::from_bytes(bytes) {
            Ok(e) => e,
            Err(e) => {
                first_err.get_or_insert(StoreError::Wal(e));
                return Ok(());
            }
        };
        let res = match entry.op {
            LogOp::Set => Job::from_bytes(&entry.payload)
                .map_err(StoreError::Job)
                .and_then(|job| {
                    let body = job.to_bytes()?;
                    apply_set(conn, &entry.collection, &job, &body, offset)
                }),
            LogOp::Delete => {
                let job_id = String::from_utf8_lossy(&entry.payload).to_string();
                apply_delete(conn, &entry.collection, &job_id, offset).map(|_| ())
            }
        };
        if let Err(e) = res {
            first_err.get_or_insert(e);
        }
        Ok(())
    })?;

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> ShardStore {
        ShardStore::open(
            7,
            dir.join("7.db"),
            dir.join("7"),
            WalOptions::default(),
        )
        .unwrap()
    }

    fn job(id: &str, trigger_ms: i64) -> Job {
        Job {
            id: id.into(),
            trigger_ms,
            meta: serde_json::json!({"k": id}),
            route: "R1".into(),
        }
    }

    #[test]
    fn set_then_get_roundtrips() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let j = job("a", 180_000);
        let offset = store.set("jobs", &j).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(store.get("jobs", "a").unwrap(), j);
    }

    #[test]
    fn get_distinguishes_missing_collection_from_missing_key() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        store.set("jobs", &job("a", 60_000)).unwrap();

        assert!(matches!(
            store.get("other", "a"),
            Err(StoreError::BucketNotFound)
        ));
        assert!(matches!(
            store.get("jobs", "zzz"),
            Err(StoreError::KeyNotFound)
        ));
    }

    #[test]
    fn set_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        let j = job("a", 120_000);
        store.set("jobs", &j).unwrap();
        store.set("jobs", &j).unwrap();

        assert_eq!(store.get("jobs", "a").unwrap(), j);
        assert_eq!(store.fetch_bucket(2).unwrap(), vec![j]);
    }

    #[test]
    fn update_moves_the_bucket_entry() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.set("jobs", &job("a", 120_000)).unwrap();
        store.set("jobs", &job("a", 300_000)).unwrap();

        // The old minute bucket is empty, the new one holds the job.
        assert!(store.fetch_bucket(2).unwrap().is_empty());
        let bucket = store.fetch_bucket(5).unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].trigger_ms, 300_000);
    }

    #[test]
    fn delete_removes_both_spaces() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.set("jobs", &job("a", 120_000)).unwrap();
        let offset = store.delete("jobs", "a").unwrap();
        assert_eq!(offset, 1);

        assert!(matches!(
            store.get("jobs", "a"),
            Err(StoreError::KeyNotFound) | Err(StoreError::BucketNotFound)
        ));
        assert!(store.fetch_bucket(2).unwrap().is_empty());
    }

    #[test]
    fn double_delete_reports_key_not_found() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.set("jobs", &job("a", 120_000)).unwrap();
        store.delete("jobs", "a").unwrap();
        assert!(matches!(
            store.delete("jobs", "a"),
            Err(StoreError::KeyNotFound)
        ));
    }

    #[test]
    fn fetch_bucket_returns_only_that_minute() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.set("jobs", &job("a", 120_000)).unwrap();
        store.set("jobs", &job("b", 125_000)).unwrap();
        store.set("jobs", &job("c", 185_000)).unwrap();

        let bucket = store.fetch_bucket(2).unwrap();
        let mut ids: Vec<&str> = bucket.iter().map(|j| j.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(store.fetch_bucket(4).unwrap().is_empty());
    }

    #[test]
    fn fetch_bucket_handles_underscored_job_ids() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        store.set("jobs", &job("order_42_x", 60_000)).unwrap();
        let bucket = store.fetch_bucket(1).unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].id, "order_42_x");
    }

    #[test]
    fn wal_offsets_increase_across_operations() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());

        assert_eq!(store.set("jobs", &job("a", 60_000)).unwrap(), 0);
        assert_eq!(store.set("jobs", &job("b", 60_000)).unwrap(), 1);
        assert_eq!(store.delete("jobs", "a").unwrap(), 2);
        assert_eq!(store.latest_offset(), 2);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store.set("jobs", &job("a", 120_000)).unwrap();
            store.set("jobs", &job("b", 120_000)).unwrap();
            store.delete("jobs", "a").unwrap();
            store.close().unwrap();
        }

        let store = open_store(dir.path());
        assert!(store.get("jobs", "b").is_ok());
        assert!(matches!(
            store.get("jobs", "a"),
            Err(StoreError::KeyNotFound)
        ));
        let bucket = store.fetch_bucket(2).unwrap();
        assert_eq!(bucket.len(), 1);
        assert_eq!(bucket[0].id, "b");
    }

    #[test]
    fn replay_recovers_records_the_engine_never_applied() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("7.db");
        let wal_dir = dir.path().join("7");

        // Write records straight into the WAL, bypassing the engine, as if
        // the process died between the append and the transaction.
        {
            let mut wal = Wal::open(&wal_dir, WalOptions::default()).unwrap();
            let j = job("ghost", 240_000);
            wal.append(&LogEntry::set("jobs", j.to_bytes().unwrap()))
                .unwrap();
            wal.close().unwrap();
        }

        let store =
            ShardStore::open(7, &db_path, &wal_dir, WalOptions::default()).unwrap();
        assert_eq!(store.get("jobs", "ghost").unwrap().trigger_ms, 240_000);
        assert_eq!(store.fetch_bucket(4).unwrap().len(), 1);

        // Replay converged: reopening again applies nothing new.
        store.close().unwrap();
        let store =
            ShardStore::open(7, &db_path, &wal_dir, WalOptions::default()).unwrap();
        assert_eq!(store.fetch_bucket(4).unwrap().len(), 1);
    }
}
