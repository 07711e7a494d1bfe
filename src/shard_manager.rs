//! Ownership of the shard stores this node participates in, as leader or
//! follower.
//!
//! On-disk layout under the parent directory: `{parent}/{shard}.db` for the
//! engine file and `{parent}/{shard}/` for that shard's WAL segments.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::info;

use crate::dht::ShardId;
use crate::store::{ShardStore, StoreError};
use crate::wal::WalOptions;

#[derive(Error, Debug)]
pub enum ShardManagerError {
    #[error("shard stores not initialised")]
    NotInitialised,

    #[error("shard {0} not owned by this node")]
    NotOwned(ShardId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ShardManager {
    parent_dir: PathBuf,
    wal_opts: WalOptions,
    stores: RwLock<HashMap<ShardId, Arc<ShardStore>>>,
}

impl ShardManager {
    pub fn new(parent_dir: impl Into<PathBuf>, wal_opts: WalOptions) -> ShardManager {
        ShardManager {
            parent_dir: parent_dir.into(),
            wal_opts,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Opens stores for every shard in `shard_ids` that is not already open.
    /// Called at startup and again on every shard-map change; already-open
    /// stores are left untouched.
    pub fn initialise(&self, shard_ids: &[ShardId]) -> Result<(), ShardManagerError> {
        std::fs::create_dir_all(&self.parent_dir)
            .map_err(|e| ShardManagerError::Store(StoreError::Wal(e.into())))?;

        for &shard in shard_ids {
            if self.stores.read().unwrap().contains_key(&shard) {
                continue;
            }
            let db_path = self.parent_dir.join(format!("{}.db", shard));
            let wal_dir = self.parent_dir.join(shard.to_string());
            let store = ShardStore::open(shard, &db_path, &wal_dir, self.wal_opts.clone())?;
            info!(shard, path = %db_path.display(), "initialised shard store");
            self.stores.write().unwrap().insert(shard, Arc::new(store));
        }
        Ok(())
    }

    /// Returns the store for a shard this node owns.
    pub fn get(&self, shard: ShardId) -> Result<Arc<ShardStore>, ShardManagerError> {
        let stores = self.stores.read().unwrap();
        if stores.is_empty() {
            return Err(ShardManagerError::NotInitialised);
        }
        stores
            .get(&shard)
            .cloned()
            .ok_or(ShardManagerError::NotOwned(shard))
    }

    /// True once any store has been opened.
    pub fn is_initialised(&self) -> bool {
        !self.stores.read().unwrap().is_empty()
    }

    pub fn owned_shards(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.stores.read().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Flushes and closes every store. Stores still referenced elsewhere are
    /// dropped from the map and close when the last handle goes away.
    pub fn close(&self) -> Result<(), ShardManagerError> {
        let mut stores = self.stores.write().unwrap();
        for (shard, store) in stores.drain() {
            match Arc::try_unwrap(store) {
                Ok(store) => store.close()?,
                Err(_) => info!(shard, "shard store still in use at close; deferring to drop"),
            }
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use tempfile::tempdir;

    #[test]
    fn get_before_initialise_fails() {
        let dir = tempdir().unwrap();
        let mgr = ShardManager::new(dir.path(), WalOptions::default());
        assert!(matches!(
            mgr.get(0),
            Err(ShardManagerError::NotInitialised)
        ));
    }

    #[test]
    fn initialise_creates_expected_layout() {
        let dir = tempdir().unwrap();
        let mgr = ShardManager::new(dir.path(), WalOptions::default());
        mgr.initialise(&[0, 3, 7]).unwrap();

        assert_eq!(mgr.owned_shards(), vec![0, 3, 7]);
        assert!(dir.path().join("3.db").exists());
        assert!(dir.path().join("3").is_dir());

        assert!(mgr.get(3).is_ok());
        assert!(matches!(mgr.get(5), Err(ShardManagerError::NotOwned(5))));
    }

    #[test]
    fn reinitialise_is_idempotent_and_additive() {
        let dir = tempdir().unwrap();
        let mgr = ShardManager::new(dir.path(), WalOptions::default());
        mgr.initialise(&[1]).unwrap();

        let job = Job {
            id: "a".into(),
            trigger_ms: 60_000,
            meta: serde_json::Value::Null,
            route: "r".into(),
        };
        mgr.get(1).unwrap().set("jobs", &job).unwrap();

        mgr.initialise(&[1, 2]).unwrap();
        assert_eq!(mgr.owned_shards(), vec![1, 2]);
        // Shard 1 kept its open store and data.
        assert!(mgr.get(1).unwrap().get("jobs", "a").is_ok());
    }

    #[test]
    fn close_then_reopen_preserves_data() {
        let dir = tempdir().unwrap();
        {
            let mgr = ShardManager::new(dir.path(), WalOptions::default());
            mgr.initialise(&[4]).unwrap();
            let job = Job {
                id: "persist".into(),
                trigger_ms: 60_000,
                meta: serde_json::Value::Null,
                route: "r".into(),
            };
            mgr.get(4).unwrap().set("jobs", &job).unwrap();
            mgr.close().unwrap();
        }

        let mgr = ShardManager::new(dir.path(), WalOptions::default());
        mgr.initialise(&[4]).unwrap();
        assert!(mgr.get(4).unwrap().get("jobs", "persist").is_ok());
    }
}
