//! Data-plane entry point on every node.
//!
//! Every request resolves placement through the DHT first. Reads prefer the
//! local replica when this node participates in the shard. Writes run at the
//! shard leader: commit to the local WAL-fronted store, hand the job to the
//! executor when it falls inside the grace horizon, then replicate
//! synchronously to every follower. A write arriving at a non-leader is
//! forwarded to the leader over the peer channel.
//!
//! Route reads are served from the local table; route writes ride the Raft
//! command stream so every node converges on the same table.

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::{ConnectionError, ConnectionManager};
use crate::dht::{Dht, DhtError, NodeId, Shard};
use crate::executor::{Executor, ExecutorError};
use crate::job::{validate_collection, Job, JobError};
use crate::metrics::{JOBS_STORED_TOTAL, REPLICATION_FAILURES_TOTAL};
use crate::raft::RaftNode;
use crate::route::{Route, RouteError};
use crate::route_table::RouteTable;
use crate::shard_manager::{ShardManager, ShardManagerError};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Validation(#[from] JobError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Placement(#[from] DhtError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Shards(#[from] ShardManagerError),

    #[error(transparent)]
    Peer(#[from] ConnectionError),

    #[error("replication to follower {node} failed: {source}")]
    Replication {
        node: NodeId,
        #[source]
        source: ConnectionError,
    },

    #[error("consensus rejected the command: {0}")]
    RaftApply(String),
}

pub struct Coordinator {
    self_node: NodeId,
    dht: Arc<Dht>,
    shards: Arc<ShardManager>,
    peers: ConnectionManager,
    executor: Arc<Executor>,
    routes: Arc<RouteTable>,
    raft: Arc<RaftNode>,
}

impl Coordinator {
    pub fn new(
        self_node: NodeId,
        dht: Arc<Dht>,
        shards: Arc<ShardManager>,
        peers: ConnectionManager,
        executor: Arc<Executor>,
        routes: Arc<RouteTable>,
        raft: Arc<RaftNode>,
    ) -> Coordinator {
        Coordinator {
            self_node,
            dht,
            shards,
            peers,
            executor,
            routes,
            raft,
        }
    }

    // ── Jobs ──────────────────────────────────────────────────────────────

    /// Reads a job, preferring a local replica over a remote leader read.
    pub async fn get(&self, collection: &str, job_id: &str) -> Result<Job, CoordinatorError> {
        validate_collection(collection)?;
        let shard = self.dht.locate(job_id)?;

        if let Ok(store) = self.shards.get(shard.id) {
            return Ok(store.get(collection, job_id)?);
        }

        let peer = self.peers.get(&shard.leader)?;
        Ok(peer.get_job(collection, job_id).await?)
    }

    /// Writes a job: forward to the shard leader, or commit locally and
    /// replicate to every follower. Returns the leader's WAL offset.
    pub async fn set(&self, collection: &str, job: &Job) -> Result<i64, CoordinatorError> {
        validate_collection(collection)?;
        job.validate()?;

        let shard = self.dht.locate(&job.id)?;
        if shard.leader != self.self_node {
            debug!(job_id = %job.id, leader = %shard.leader, "forwarding write to shard leader");
            let peer = self.peers.get(&shard.leader)?;
            return Ok(peer.set_job(collection, job).await?);
        }

        let store = self.shards.get(shard.id)?;
        let offset = store.set(collection, job)?;
        JOBS_STORED_TOTAL.inc();

        // Only the leader schedules. Jobs beyond the grace horizon are
        // picked up later by the minute poll.
        if self.executor.within_grace(job.trigger_ms) {
            match self.executor.queue(job.clone()) {
                Ok(()) | Err(ExecutorError::TooLate) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "executor rejected job at write"),
            }
        }

        self.replicate(&shard, |peer| {
            let job = job.clone();
            let collection = collection.to_string();
            async move { peer.replicate_set(&collection, &job).await }
        })
        .await?;

        Ok(offset)
    }

    /// Deletes a job with the same forward-or-local logic as `set`.
    pub async fn delete(&self, collection: &str, job_id: &str) -> Result<i64, CoordinatorError> {
        validate_collection(collection)?;
        if job_id.is_empty() {
            return Err(JobError::InvalidId.into());
        }

        let shard = self.dht.locate(job_id)?;
        if shard.leader != self.self_node {
            debug!(job_id, leader = %shard.leader, "forwarding delete to shard leader");
            let peer = self.peers.get(&shard.leader)?;
            return Ok(peer.delete_job(collection, job_id).await?);
        }

        let store = self.shards.get(shard.id)?;
        let offset = store.delete(collection, job_id)?;

        // Absent from the executor just means it was never scheduled here.
        match self.executor.delete(job_id) {
            Ok(()) | Err(ExecutorError::JobNotFound) => {}
            Err(e) => warn!(job_id, error = %e, "executor delete failed"),
        }

        self.replicate(&shard, |peer| {
            let collection = collection.to_string();
            let job_id = job_id.to_string();
            async move { peer.replicate_delete(&collection, &job_id).await }
        })
        .await?;

        Ok(offset)
    }

    /// Applies a replicated write to the local follower store. Never
    /// forwarded and never enters the executor: only the leader schedules.
    pub fn replicate_set(&self, collection: &str, job: &Job) -> Result<i64, CoordinatorError> {
        let shard = self.dht.locate(&job.id)?;
        let store = self.shards.get(shard.id)?;
        Ok(store.set(collection, job)?)
    }

    /// Applies a replicated delete to the local follower store.
    pub fn replicate_delete(&self, collection: &str, job_id: &str) -> Result<i64, CoordinatorError> {
        let shard = self.dht.locate(job_id)?;
        let store = self.shards.get(shard.id)?;
        Ok(store.delete(collection, job_id)?)
    }

    /// Replicates one mutation to every follower in parallel and surfaces
    /// the first failure. The leader's write stands either way; the caller
    /// must treat an error as "outcome unknown" and retry idempotently.
    async fn replicate<F, Fut>(&self, shard: &Shard, make_call: F) -> Result<(), CoordinatorError>
    where
        F: Fn(crate::connection::PeerClient) -> Fut,
        Fut: std::future::Future<Output = Result<i64, ConnectionError>>,
    {
        let mut calls = Vec::with_capacity(shard.followers.len());
        let mut targets = Vec::with_capacity(shard.followers.len());
        for follower in &shard.followers {
            let peer = self.peers.get(follower)?;
            targets.push(follower.clone());
            calls.push(make_call(peer));
        }

        let results = join_all(calls).await;
        for (node, result) in targets.into_iter().zip(results) {
            if let Err(source) = result {
                REPLICATION_FAILURES_TOTAL.inc();
                warn!(follower = %node, error = %source, "follower replication failed");
                return Err(CoordinatorError::Replication { node, source });
            }
        }
        Ok(())
    }

    // ── Routes ────────────────────────────────────────────────────────────

    pub fn get_route(&self, route_id: &str) -> Result<Route, CoordinatorError> {
        if route_id.is_empty() {
            return Err(RouteError::InvalidId.into());
        }
        self.routes
            .get(route_id)
            .ok_or_else(|| RouteError::NotFound(route_id.to_string()).into())
    }

    /// Validates and commits a route addition through the FSM.
    pub async fn set_route(&self, route: Route) -> Result<(), CoordinatorError> {
        route.validate()?;
        self.raft
            .add_route(route)
            .await
            .map_err(|e| CoordinatorError::RaftApply(e.to_string()))
    }

    /// Commits a route removal through the FSM.
    pub async fn delete_route(&self, route_id: &str) -> Result<(), CoordinatorError> {
        if route_id.is_empty() {
            return Err(RouteError::InvalidId.into());
        }
        self.raft
            .remove_route(route_id)
            .await
            .map_err(|e| CoordinatorError::RaftApply(e.to_string()))
    }
}
