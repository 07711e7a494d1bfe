//! Binds the DHT view to this node's shard stores and peer connections, and
//! drives the storage half of the two-stage scheduler.
//!
//! The control-plane FSM bumps a `watch` channel on every committed
//! shard-map change; the node manager reacts by opening stores for newly
//! owned shards and registering connections for newly seen peers. Its
//! minute-poll loop sweeps the next minute's bucket out of every locally-led
//! shard store into the executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address;
use crate::connection::ConnectionManager;
use crate::dht::{Dht, NodeId};
use crate::executor::{Executor, ExecutorError};
use crate::job::{current_millis, MILLIS_PER_MINUTE};
use crate::raft::RaftNode;
use crate::shard_manager::ShardManager;

pub struct NodeManager {
    self_node: NodeId,
    dht: Arc<Dht>,
    shards: Arc<ShardManager>,
    peers: ConnectionManager,
    executor: Arc<Executor>,
    raft: Arc<RaftNode>,
}

impl NodeManager {
    pub fn new(
        self_node: NodeId,
        dht: Arc<Dht>,
        shards: Arc<ShardManager>,
        peers: ConnectionManager,
        executor: Arc<Executor>,
        raft: Arc<RaftNode>,
    ) -> Arc<NodeManager> {
        Arc::new(NodeManager {
            self_node,
            dht,
            shards,
            peers,
            executor,
            raft,
        })
    }

    /// Re-reads the shard map: opens stores for every shard this node
    /// participates in and refreshes peer connections for every member
    /// node. Idempotent; called at startup and on every map change.
    pub fn initialise_node(&self) {
        if !self.dht.is_initialised() {
            debug!("shard map empty; nothing to initialise");
            return;
        }

        let owned = self.dht.all_shards(&self.self_node);
        if let Err(e) = self.shards.initialise(&owned) {
            error!(error = %e, "failed to initialise shard stores");
            return;
        }

        for node in self.dht.member_nodes() {
            if node == self.self_node {
                continue;
            }
            let Some(member) = self.raft.node_by_name(&node) else {
                warn!(node = %node, "shard map references a node missing from raft membership");
                continue;
            };
            let Some(grpc_addr) = address::grpc_address(&member.raft_addr) else {
                warn!(node = %node, raft_addr = %member.raft_addr, "cannot derive grpc address");
                continue;
            };
            if let Err(e) = self.peers.add(&node, &grpc_addr) {
                warn!(node = %node, error = %e, "failed to register peer connection");
            }
        }

        info!(
            owned_shards = owned.len(),
            leader_shards = self.dht.leader_shards(&self.self_node).len(),
            "node initialised against shard map"
        );
    }

    /// Reacts to committed shard-map generations until shutdown.
    pub fn spawn_map_watcher(
        self: &Arc<Self>,
        mut map_gen_rx: watch::Receiver<u64>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = map_gen_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let generation = *map_gen_rx.borrow_and_update();
                        info!(generation, "shard map changed; re-initialising node");
                        mgr.initialise_node();
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
        })
    }

    /// Sweeps due minute buckets into the executor until shutdown.
    pub fn spawn_minute_poll(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mgr = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(MILLIS_PER_MINUTE as u64));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => mgr.poll_buckets(),
                    _ = shutdown_rx.changed() => return,
                }
            }
        })
    }

    /// Feeds the executor from every locally-led shard.
    ///
    /// Covers the upcoming minute plus the current one — the latter matters
    /// after a restart, when jobs due in the remainder of this minute exist
    /// only in the stores. Re-supplying a job the executor already holds is
    /// harmless: versioning collapses duplicates to one dispatch.
    pub fn poll_buckets(&self) {
        let current_minute = current_millis() / MILLIS_PER_MINUTE;
        let leader_shards = self.dht.leader_shards(&self.self_node);
        let mut queued = 0usize;

        for shard_id in leader_shards {
            let store = match self.shards.get(shard_id) {
                Ok(store) => store,
                Err(e) => {
                    warn!(shard = shard_id, error = %e, "led shard has no local store");
                    continue;
                }
            };

            for minute in [current_minute, current_minute + 1] {
                let jobs = match store.fetch_bucket(minute) {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!(shard = shard_id, minute, error = %e, "bucket fetch failed");
                        continue;
                    }
                };
                for job in jobs {
                    match self.executor.queue(job) {
                        Ok(()) => queued += 1,
                        // Already fired, or beyond grace; the next poll gets it.
                        Err(ExecutorError::TooLate)
                        | Err(ExecutorError::NotWithinGracePeriod) => {}
                        Err(e) => {
                            warn!(shard = shard_id, error = %e, "minute poll could not queue job")
                        }
                    }
                }
            }
        }

        if queued > 0 {
            debug!(queued, minute = current_minute, "minute poll queued jobs");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
