//! Placement: the deterministic mapping from job keys to shards and from
//! shards to nodes.
//!
//! `shard_of` is a stable hash-modulo (`xxh64(key) mod S`) so every node that
//! has loaded the same shard map resolves a key identically. The shard map
//! itself is owned by the control-plane FSM: it is replaced wholesale on
//! every rebalance or failover and read under a shared lock everywhere else.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

pub type ShardId = u64;
pub type NodeId = String;

#[derive(Error, Debug, PartialEq)]
pub enum DhtError {
    #[error("shard map not initialised")]
    NotInitialised,

    #[error("replication factor {replicas} exceeds node count {nodes}")]
    ReplicasExceedNodes { replicas: usize, nodes: usize },

    #[error("shard count must be non-zero")]
    NoShards,

    #[error("shard {0} missing from shard map")]
    ShardMissing(ShardId),
}

/// One shard's placement: a leader and an ordered follower list.
///
/// The follower order is the failover order; `leader` never appears in
/// `followers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub leader: NodeId,
    pub followers: Vec<NodeId>,
}

/// The full placement truth: every shard in `[0, shard_count)`.
pub type ShardMap = BTreeMap<ShardId, Shard>;

/// Builds the initial shard map for a fresh cluster.
///
/// Shard `i` gets `leader = nodes[i mod N]` and the next `replication - 1`
/// nodes (wrapping) as followers.
pub fn bootstrap(
    shard_count: u64,
    nodes: &[NodeId],
    replication: usize,
) -> Result<ShardMap, DhtError> {
    if shard_count == 0 {
        return Err(DhtError::NoShards);
    }
    if replication == 0 || replication > nodes.len() {
        return Err(DhtError::ReplicasExceedNodes {
            replicas: replication,
            nodes: nodes.len(),
        });
    }

    let n = nodes.len() as u64;
    let mut map = ShardMap::new();
    for i in 0..shard_count {
        let leader = nodes[(i % n) as usize].clone();
        let followers = (1..replication as u64)
            .map(|r| nodes[((i + r) % n) as usize].clone())
            .collect();
        map.insert(
            i,
            Shard {
                id: i,
                leader,
                followers,
            },
        );
    }
    Ok(map)
}

/// Rewrites the map after nodes became unreachable: every shard led by one
/// of them promotes its first follower.
///
/// The promoted follower leaves the follower list and the demoted leader is
/// appended at its tail, keeping the replica count intact and giving the
/// node a recovery path as a follower. Shards whose entire replica set is
/// unreachable are left untouched.
pub fn demote_leaders(map: &ShardMap, unreachable: &[NodeId]) -> ShardMap {
    let mut out = map.clone();
    for shard in out.values_mut() {
        if !unreachable.contains(&shard.leader) {
            continue;
        }
        let Some(pos) = shard
            .followers
            .iter()
            .position(|f| !unreachable.contains(f))
        else {
            continue;
        };
        let promoted = shard.followers.remove(pos);
        let demoted = std::mem::replace(&mut shard.leader, promoted);
        shard.followers.push(demoted);
    }
    out
}

/// Node-local view of the shard map.
pub struct Dht {
    shards: RwLock<ShardMap>,
}

impl Dht {
    pub fn new() -> Dht {
        Dht {
            shards: RwLock::new(ShardMap::new()),
        }
    }

    /// Stable key → shard mapping. Identical on every node with the same map.
    pub fn shard_of(&self, key: &str) -> Result<ShardId, DhtError> {
        let shards = self.shards.read().unwrap();
        if shards.is_empty() {
            return Err(DhtError::NotInitialised);
        }
        Ok(xxh64(key.as_bytes(), 0) % shards.len() as u64)
    }

    /// Resolves a key to its shard's placement record.
    pub fn locate(&self, key: &str) -> Result<Shard, DhtError> {
        let id = self.shard_of(key)?;
        let shards = self.shards.read().unwrap();
        shards.get(&id).cloned().ok_or(DhtError::ShardMissing(id))
    }

    /// Placement record for a known shard id.
    pub fn shard(&self, id: ShardId) -> Result<Shard, DhtError> {
        let shards = self.shards.read().unwrap();
        if shards.is_empty() {
            return Err(DhtError::NotInitialised);
        }
        shards.get(&id).cloned().ok_or(DhtError::ShardMissing(id))
    }

    /// Shards the node leads.
    pub fn leader_shards(&self, node: &str) -> Vec<ShardId> {
        let shards = self.shards.read().unwrap();
        shards
            .values()
            .filter(|s| s.leader == node)
            .map(|s| s.id)
            .collect()
    }

    /// Shards the node participates in, as leader or follower.
    pub fn all_shards(&self, node: &str) -> Vec<ShardId> {
        let shards = self.shards.read().unwrap();
        shards
            .values()
            .filter(|s| s.leader == node || s.followers.iter().any(|f| f == node))
            .map(|s| s.id)
            .collect()
    }

    /// Every node appearing anywhere in the map.
    pub fn member_nodes(&self) -> Vec<NodeId> {
        let shards = self.shards.read().unwrap();
        let mut nodes: Vec<NodeId> = Vec::new();
        for s in shards.values() {
            if !nodes.contains(&s.leader) {
                nodes.push(s.leader.clone());
            }
            for f in &s.followers {
                if !nodes.contains(f) {
                    nodes.push(f.clone());
                }
            }
        }
        nodes.sort();
        nodes
    }

    pub fn is_initialised(&self) -> bool {
        !self.shards.read().unwrap().is_empty()
    }

    /// Deep copy of the current map.
    pub fn snapshot(&self) -> ShardMap {
        self.shards.read().unwrap().clone()
    }

    /// Replaces the map wholesale.
    pub fn load(&self, map: ShardMap) {
        *self.shards.write().unwrap() = map;
    }
}

impl Default for Dht {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn three_nodes() -> Vec<NodeId> {
        vec!["node1".into(), "node2".into(), "node3".into()]
    }

    fn loaded_dht() -> Dht {
        let dht = Dht::new();
        dht.load(bootstrap(12, &three_nodes(), 3).unwrap());
        dht
    }

    #[test]
    fn bootstrap_shape() {
        let map = bootstrap(12, &three_nodes(), 3).unwrap();
        assert_eq!(map.len(), 12);

        for (id, shard) in &map {
            assert_eq!(shard.id, *id);
            assert_eq!(shard.followers.len(), 2);
            // Leader never appears in its own follower list.
            assert!(!shard.followers.contains(&shard.leader));
            // Followers are distinct.
            assert_ne!(shard.followers[0], shard.followers[1]);
        }

        assert_eq!(map[&0].leader, "node1");
        assert_eq!(map[&0].followers, vec!["node2".to_string(), "node3".to_string()]);
        assert_eq!(map[&5].leader, "node3");
    }

    #[test]
    fn bootstrap_rejects_excess_replication() {
        let err = bootstrap(12, &three_nodes(), 4).unwrap_err();
        assert_eq!(
            err,
            DhtError::ReplicasExceedNodes {
                replicas: 4,
                nodes: 3
            }
        );
    }

    #[test]
    fn shard_of_fails_before_load() {
        let dht = Dht::new();
        assert_eq!(dht.shard_of("ABCD"), Err(DhtError::NotInitialised));
        assert!(matches!(dht.locate("ABCD"), Err(DhtError::NotInitialised)));
    }

    #[test]
    fn placement_is_stable() {
        // xxh64("ABCD") mod 12 == 2, so nodes[2 mod 3] leads.
        let dht = loaded_dht();
        let shard = dht.locate("ABCD").unwrap();
        assert_eq!(shard.leader, "node3");
        assert_eq!(shard.followers, vec!["node1".to_string(), "node2".to_string()]);
    }

    #[test]
    fn different_keys_may_share_a_shard() {
        let dht = loaded_dht();
        let a = dht.shard_of("ABCD").unwrap();
        let b = dht.shard_of(")(*&^%$#@!aitgehv)").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shard_of_agrees_across_instances() {
        let a = loaded_dht();
        let b = loaded_dht();
        for key in ["ABCD", "job-1", "j2", "", "a_b_c"] {
            assert_eq!(a.shard_of(key).unwrap(), b.shard_of(key).unwrap());
        }
    }

    #[test]
    fn membership_queries() {
        let dht = loaded_dht();
        // 12 shards over 3 nodes: each node leads 4 and follows the rest.
        assert_eq!(dht.leader_shards("node1").len(), 4);
        assert_eq!(dht.all_shards("node1").len(), 12);
        assert!(dht.leader_shards("node9").is_empty());
        assert_eq!(dht.member_nodes(), three_nodes());
    }

    #[test]
    fn snapshot_is_a_deep_copy() {
        let dht = loaded_dht();
        let mut snap = dht.snapshot();
        snap.get_mut(&0).unwrap().leader = "node9".into();
        assert_eq!(dht.shard(0).unwrap().leader, "node1");
    }

    #[test]
    fn demotion_promotes_first_reachable_follower() {
        let map = bootstrap(12, &three_nodes(), 3).unwrap();
        let unreachable = vec!["node1".to_string()];
        let next = demote_leaders(&map, &unreachable);

        for (id, shard) in &next {
            let old = &map[id];
            if old.leader == "node1" {
                assert_eq!(shard.leader, old.followers[0]);
                assert_eq!(shard.followers.len(), 2);
                assert_eq!(shard.followers.last().unwrap(), "node1");
                assert!(!shard.followers.contains(&shard.leader));
            } else {
                assert_eq!(shard, old);
            }
        }
    }

    #[test]
    fn demotion_skips_fully_unreachable_shards() {
        let map = bootstrap(4, &three_nodes(), 3).unwrap();
        let all: Vec<NodeId> = three_nodes();
        let next = demote_leaders(&map, &all);
        assert_eq!(next, map);
    }

    #[test]
    fn shard_map_json_roundtrip() {
        let map = bootstrap(4, &three_nodes(), 2).unwrap();
        let j = serde_json::to_string(&map).unwrap();
        let back: ShardMap = serde_json::from_str(&j).unwrap();
        assert_eq!(back, map);
    }
}
