//! Leader-only cluster failure detector.
//!
//! Every poll interval the current Raft leader probes each peer over the
//! connection manager. A peer that misses `threshold` consecutive probes has
//! its led shards handed to their first reachable follower: the transform in
//! [`crate::dht::demote_leaders`] produces the new map, which is published
//! through the FSM so every node converges on it. A node is demoted at most
//! once per outage; a successful probe resets its slate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::connection::ConnectionManager;
use crate::dht::{demote_leaders, Dht, NodeId};
use crate::metrics::PEER_UNREACHABLE_TOTAL;
use crate::raft::RaftNode;

struct NodeHealth {
    last_contact: Option<Instant>,
    unreachable_count: u32,

    /// Set once this node's shards have been reassigned, so a long outage
    /// does not trigger repeated demotions.
    marked_unreachable: bool,
}

/// Pure probe bookkeeping, separated from the poll loop for testability.
pub(crate) struct HealthTracker {
    threshold: u32,
    nodes: HashMap<NodeId, NodeHealth>,
}

impl HealthTracker {
    fn new(threshold: u32) -> HealthTracker {
        HealthTracker {
            threshold,
            nodes: HashMap::new(),
        }
    }

    /// Records one probe result. Returns true when the node just crossed
    /// the unreachable threshold and must be demoted.
    fn observe(&mut self, node: &str, reachable: bool) -> bool {
        let entry = self.nodes.entry(node.to_string()).or_insert(NodeHealth {
            last_contact: None,
            unreachable_count: 0,
            marked_unreachable: false,
        });

        if reachable {
            entry.last_contact = Some(Instant::now());
            entry.unreachable_count = 0;
            entry.marked_unreachable = false;
            return false;
        }

        entry.unreachable_count += 1;
        PEER_UNREACHABLE_TOTAL.with_label_values(&[node]).inc();
        warn!(
            node,
            misses = entry.unreachable_count,
            marked = entry.marked_unreachable,
            "peer unreachable"
        );

        if entry.unreachable_count >= self.threshold && !entry.marked_unreachable {
            info!(
                node,
                misses = entry.unreachable_count,
                last_contact = ?entry.last_contact,
                "peer crossed unreachable threshold"
            );
            entry.marked_unreachable = true;
            return true;
        }
        false
    }
}

pub struct ClusterHealth {
    dht: Arc<Dht>,
    raft: Arc<RaftNode>,
    peers: ConnectionManager,
    poll_interval: Duration,
    threshold: u32,
}

impl ClusterHealth {
    pub fn new(
        dht: Arc<Dht>,
        raft: Arc<RaftNode>,
        peers: ConnectionManager,
        poll_interval: Duration,
        threshold: u32,
    ) -> ClusterHealth {
        ClusterHealth {
            dht,
            raft,
            peers,
            poll_interval,
            threshold,
        }
    }

    /// Runs the probe loop until shutdown. Probes happen on every node but
    /// only the Raft leader acts on the results.
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tracker = HealthTracker::new(self.threshold);
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => return,
                }

                if !self.raft.is_leader() {
                    continue;
                }

                let report = self.peers.health_status().await;
                for (node, reachable) in report {
                    if tracker.observe(&node, reachable) {
                        self.handle_node_failure(&node).await;
                    }
                }
            }
        })
    }

    /// Reassigns every shard led by the failed node and publishes the new
    /// map through the FSM. Raft handles split brain: only the leader's
    /// publication commits.
    async fn handle_node_failure(&self, node: &str) {
        info!(unreachable = node, "handling node failure");

        let snapshot = self.dht.snapshot();
        let next = demote_leaders(&snapshot, &[node.to_string()]);
        if next == snapshot {
            info!(unreachable = node, "no led shards to reassign");
            return;
        }

        if let Err(e) = self.raft.publish_shard_map(next).await {
            error!(unreachable = node, error = %e, "failed to publish demoted shard map");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
