//! Long-lived RPC clients to every peer node.
//!
//! Channels are created lazily (tonic dials on the first RPC and reconnects
//! on failure) so `add` never blocks, and every RPC carries the configured
//! deadline via the endpoint timeout. `health_status` drives the cluster
//! failure detector.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::dht::NodeId;
use crate::grpc::proto::job_store_client::JobStoreClient;
use crate::grpc::proto::{HealthRequest, JobCreationDetails, JobFetchDetails};
use crate::job::{Job, JobError};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("node not present")]
    NodeNotPresent,

    #[error("invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("peer rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error(transparent)]
    Decode(#[from] JobError),
}

/// A cached client to one peer's `JobStore` service.
#[derive(Clone)]
pub struct PeerClient {
    node_id: NodeId,
    address: String,
    client: JobStoreClient<Channel>,
}

impl PeerClient {
    fn connect(node_id: &str, address: &str, rpc_timeout: Duration) -> Result<PeerClient, ConnectionError> {
        let uri = if address.starts_with("http") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        // connect_lazy() returns immediately; tonic dials on the first RPC
        // and reconnects automatically. The endpoint timeout caps every RPC.
        let channel = Endpoint::from_shared(uri)
            .map_err(|e| ConnectionError::InvalidAddress(e.to_string()))?
            .connect_timeout(Duration::from_secs(3))
            .timeout(rpc_timeout)
            .connect_lazy();

        Ok(PeerClient {
            node_id: node_id.to_string(),
            address: address.to_string(),
            client: JobStoreClient::new(channel),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn get_job(&self, collection: &str, job_id: &str) -> Result<Job, ConnectionError> {
        let resp = self
            .client
            .clone()
            .get_job(JobFetchDetails {
                id: job_id.to_string(),
                collection: collection.to_string(),
            })
            .await?
            .into_inner();
        Ok(job_from_details(resp))
    }

    pub async fn set_job(&self, collection: &str, job: &Job) -> Result<i64, ConnectionError> {
        let resp = self
            .client
            .clone()
            .set_job(job_to_details(collection, job))
            .await?
            .into_inner();
        Ok(resp.offset)
    }

    pub async fn delete_job(&self, collection: &str, job_id: &str) -> Result<i64, ConnectionError> {
        let resp = self
            .client
            .clone()
            .delete_job(JobFetchDetails {
                id: job_id.to_string(),
                collection: collection.to_string(),
            })
            .await?
            .into_inner();
        Ok(resp.offset)
    }

    pub async fn replicate_set(&self, collection: &str, job: &Job) -> Result<i64, ConnectionError> {
        let resp = self
            .client
            .clone()
            .replicate_set_job(job_to_details(collection, job))
            .await?
            .into_inner();
        Ok(resp.offset)
    }

    pub async fn replicate_delete(
        &self,
        collection: &str,
        job_id: &str,
    ) -> Result<i64, ConnectionError> {
        let resp = self
            .client
            .clone()
            .replicate_delete_job(JobFetchDetails {
                id: job_id.to_string(),
                collection: collection.to_string(),
            })
            .await?
            .into_inner();
        Ok(resp.offset)
    }

    pub async fn health_check(&self) -> Result<(), ConnectionError> {
        self.client
            .clone()
            .health_check(HealthRequest {
                node_id: self.node_id.clone(),
            })
            .await?;
        Ok(())
    }
}

pub fn job_to_details(collection: &str, job: &Job) -> JobCreationDetails {
    JobCreationDetails {
        trigger_time: job.trigger_ms,
        id: job.id.clone(),
        meta: job.meta_bytes(),
        route: job.route.clone(),
        collection: collection.to_string(),
    }
}

pub fn job_from_details(details: JobCreationDetails) -> Job {
    Job {
        id: details.id,
        trigger_ms: details.trigger_time,
        meta: serde_json::from_slice(&details.meta).unwrap_or(serde_json::Value::Null),
        route: details.route,
    }
}

/// Pool of peer clients, keyed by node id. `Clone`-able; all clones share
/// the same map.
#[derive(Clone)]
pub struct ConnectionManager {
    clients: Arc<Mutex<HashMap<NodeId, PeerClient>>>,
    rpc_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(rpc_timeout: Duration) -> ConnectionManager {
        ConnectionManager {
            clients: Arc::new(Mutex::new(HashMap::new())),
            rpc_timeout,
        }
    }

    /// Registers a peer. Re-adding an existing node with the same address is
    /// a no-op; a changed address replaces the cached channel.
    pub fn add(&self, node_id: &str, grpc_address: &str) -> Result<(), ConnectionError> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(existing) = clients.get(node_id) {
            if existing.address == grpc_address {
                return Ok(());
            }
            info!(node_id, old = %existing.address, new = %grpc_address, "peer address changed");
        }
        let client = PeerClient::connect(node_id, grpc_address, self.rpc_timeout)?;
        debug!(node_id, address = %grpc_address, "registered peer connection");
        clients.insert(node_id.to_string(), client);
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Result<PeerClient, ConnectionError> {
        self.clients
            .lock()
            .unwrap()
            .get(node_id)
            .cloned()
            .ok_or(ConnectionError::NodeNotPresent)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.clients.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Probes every cached peer concurrently, bounded by the per-RPC
    /// timeout. Returns reachability per node.
    pub async fn health_status(&self) -> HashMap<NodeId, bool> {
        let clients: Vec<PeerClient> = self.clients.lock().unwrap().values().cloned().collect();

        let probes = clients.into_iter().map(|client| async move {
            let ok = client.health_check().await.is_ok();
            if !ok {
                warn!(node_id = %client.node_id(), "peer health probe failed");
            }
            (client.node_id().to_string(), ok)
        });

        futures::future::join_all(probes).await.into_iter().collect()
    }

    /// Drops every cached client; channels close as the handles go away.
    pub fn close(&self) {
        let mut clients = self.clients.lock().unwrap();
        for (node_id, client) in clients.drain() {
            debug!(node_id = %node_id, address = %client.address, "closing peer connection");
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(Duration::from_secs(1))
    }

    #[test]
    fn get_unknown_node_fails() {
        let cm = manager();
        assert!(matches!(
            cm.get("node9"),
            Err(ConnectionError::NodeNotPresent)
        ));
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let cm = manager();
        cm.add("node1", "127.0.0.1:8301").unwrap();
        cm.add("node1", "127.0.0.1:8301").unwrap();
        assert_eq!(cm.peer_ids(), vec!["node1".to_string()]);
        assert!(cm.get("node1").is_ok());
    }

    #[tokio::test]
    async fn changed_address_replaces_client() {
        let cm = manager();
        cm.add("node1", "127.0.0.1:8301").unwrap();
        cm.add("node1", "127.0.0.1:9301").unwrap();
        assert_eq!(cm.get("node1").unwrap().address, "127.0.0.1:9301");
    }

    #[test]
    fn invalid_address_is_rejected() {
        let cm = manager();
        assert!(matches!(
            cm.add("node1", "http://exa mple:80"),
            Err(ConnectionError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn close_clears_the_pool() {
        let cm = manager();
        cm.add("node1", "127.0.0.1:8301").unwrap();
        cm.add("node2", "127.0.0.1:8302").unwrap();
        cm.close();
        assert!(cm.peer_ids().is_empty());
    }

    #[test]
    fn job_details_conversion_roundtrip() {
        let job = Job {
            id: "j1".into(),
            trigger_ms: 42,
            meta: serde_json::json!({"foo": "bar"}),
            route: "R1".into(),
        };
        let details = job_to_details("jobs", &job);
        assert_eq!(details.collection, "jobs");
        let back = job_from_details(details);
        assert_eq!(back, job);
    }

    #[tokio::test]
    async fn health_status_reports_unreachable_peers() {
        let cm = ConnectionManager::new(Duration::from_millis(200));
        // Nothing listens here; the probe must come back false, not hang.
        cm.add("node1", "127.0.0.1:1").unwrap();
        let status = cm.health_status().await;
        assert_eq!(status.get("node1"), Some(&false));
    }
}
