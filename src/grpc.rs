//! Peer gRPC surface: the `JobStore` service.
//!
//! All inter-node traffic rides this one service:
//!
//! | RPC group          | Handler                                   |
//! |--------------------|-------------------------------------------|
//! | Job data plane     | delegates to the [`Coordinator`]          |
//! | Follower replication | applied to the local store only         |
//! | Health check       | answered from local Raft state            |
//! | Raft transport     | forwarded to the embedded openraft node   |
//!
//! Each Raft RPC deserialises the proto `payload` bytes back into the
//! openraft request type and forwards it to the local Raft instance.

use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::connection::{job_from_details, job_to_details};
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::raft::{RaftNode, RaftNodeId, TypeConfig};
use crate::route::RouteError;
use crate::store::StoreError;

/// Generated protobuf types and gRPC service stubs for `JobStore`.
pub mod proto {
    tonic::include_proto!("timemachine");
}

use proto::job_store_server::{JobStore, JobStoreServer};
use proto::{
    HealthRequest, HealthResponse, JobCreationDetails, JobFetchDetails, RaftReply, RaftRequest,
    SetJobResponse,
};

/// Server-side implementation of the `JobStore` gRPC service.
///
/// Both halves are optional so the server can come up before the rest of
/// the node has finished wiring; RPCs answer `Unavailable` until then.
#[derive(Clone, Default)]
pub struct JobStoreService {
    node_id: String,
    coordinator: Option<Arc<Coordinator>>,
    raft: Option<Arc<RaftNode>>,
}

impl JobStoreService {
    pub fn new(node_id: impl Into<String>) -> Self {
        JobStoreService {
            node_id: node_id.into(),
            coordinator: None,
            raft: None,
        }
    }

    pub fn with_parts(
        node_id: impl Into<String>,
        coordinator: Arc<Coordinator>,
        raft: Arc<RaftNode>,
    ) -> Self {
        JobStoreService {
            node_id: node_id.into(),
            coordinator: Some(coordinator),
            raft: Some(raft),
        }
    }

    fn coordinator(&self) -> Result<&Arc<Coordinator>, Status> {
        self.coordinator
            .as_ref()
            .ok_or_else(|| Status::unavailable("node is still starting"))
    }

    fn raft(&self) -> Result<&Arc<RaftNode>, Status> {
        self.raft
            .as_ref()
            .ok_or_else(|| Status::unavailable("consensus not running on this node"))
    }
}

fn status_from(err: CoordinatorError) -> Status {
    match &err {
        CoordinatorError::Store(StoreError::KeyNotFound)
        | CoordinatorError::Store(StoreError::BucketNotFound) => Status::not_found(err.to_string()),
        CoordinatorError::Route(RouteError::NotFound(_)) => Status::not_found(err.to_string()),
        CoordinatorError::Validation(_) | CoordinatorError::Route(_) => {
            Status::invalid_argument(err.to_string())
        }
        CoordinatorError::Placement(_) => Status::failed_precondition(err.to_string()),
        CoordinatorError::Peer(_) | CoordinatorError::Replication { .. } => {
            Status::unavailable(err.to_string())
        }
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl JobStore for JobStoreService {
    // ── Job data plane ────────────────────────────────────────────────────

    async fn get_job(
        &self,
        req: Request<JobFetchDetails>,
    ) -> Result<Response<JobCreationDetails>, Status> {
        let details = req.into_inner();
        let job = self
            .coordinator()?
            .get(&details.collection, &details.id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(job_to_details(&details.collection, &job)))
    }

    async fn set_job(
        &self,
        req: Request<JobCreationDetails>,
    ) -> Result<Response<SetJobResponse>, Status> {
        let details = req.into_inner();
        let collection = details.collection.clone();
        let job = job_from_details(details);
        let offset = self
            .coordinator()?
            .set(&collection, &job)
            .await
            .map_err(status_from)?;
        Ok(Response::new(SetJobResponse { offset }))
    }

    async fn delete_job(
        &self,
        req: Request<JobFetchDetails>,
    ) -> Result<Response<SetJobResponse>, Status> {
        let details = req.into_inner();
        let offset = self
            .coordinator()?
            .delete(&details.collection, &details.id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(SetJobResponse { offset }))
    }

    // ── Replication (leader → follower) ───────────────────────────────────

    async fn replicate_set_job(
        &self,
        req: Request<JobCreationDetails>,
    ) -> Result<Response<SetJobResponse>, Status> {
        let details = req.into_inner();
        let collection = details.collection.clone();
        let job = job_from_details(details);
        let offset = self
            .coordinator()?
            .replicate_set(&collection, &job)
            .map_err(status_from)?;
        Ok(Response::new(SetJobResponse { offset }))
    }

    async fn replicate_delete_job(
        &self,
        req: Request<JobFetchDetails>,
    ) -> Result<Response<SetJobResponse>, Status> {
        let details = req.into_inner();
        let offset = self
            .coordinator()?
            .replicate_delete(&details.collection, &details.id)
            .map_err(status_from)?;
        Ok(Response::new(SetJobResponse { offset }))
    }

    // ── Health check ──────────────────────────────────────────────────────

    async fn health_check(
        &self,
        _req: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let (state, ready) = match &self.raft {
            Some(raft) => {
                let m = raft.raft.metrics().borrow().clone();
                let state = format!("{:?}", m.state).to_lowercase();
                let ready = matches!(
                    m.state,
                    openraft::ServerState::Leader | openraft::ServerState::Follower
                );
                (state, ready)
            }
            None => ("standalone".to_string(), false),
        };
        Ok(Response::new(HealthResponse {
            node_id: self.node_id.clone(),
            state,
            cluster_ready: ready,
        }))
    }

    // ── Raft transport ────────────────────────────────────────────────────

    async fn append_entries(
        &self,
        req: Request<RaftRequest>,
    ) -> Result<Response<RaftReply>, Status> {
        let raft = self.raft()?;

        let payload = req.into_inner().payload;
        let raft_req: openraft::raft::AppendEntriesRequest<TypeConfig> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode AppendEntriesRequest: {}", e))
            })?;

        let resp = raft
            .raft
            .append_entries(raft_req)
            .await
            .map_err(|e| Status::internal(format!("raft AppendEntries error: {}", e)))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))?;

        Ok(Response::new(RaftReply {
            success: true,
            payload,
        }))
    }

    async fn request_vote(
        &self,
        req: Request<RaftRequest>,
    ) -> Result<Response<RaftReply>, Status> {
        let raft = self.raft()?;

        let payload = req.into_inner().payload;
        let raft_req: openraft::raft::VoteRequest<RaftNodeId> = serde_json::from_slice(&payload)
            .map_err(|e| Status::invalid_argument(format!("failed to decode VoteRequest: {}", e)))?;

        let resp = raft
            .raft
            .vote(raft_req)
            .await
            .map_err(|e| Status::internal(format!("raft Vote error: {}", e)))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))?;

        Ok(Response::new(RaftReply {
            success: true,
            payload,
        }))
    }

    async fn install_snapshot(
        &self,
        req: Request<RaftRequest>,
    ) -> Result<Response<RaftReply>, Status> {
        let raft = self.raft()?;

        let payload = req.into_inner().payload;
        let raft_req: openraft::raft::InstallSnapshotRequest<TypeConfig> =
            serde_json::from_slice(&payload).map_err(|e| {
                Status::invalid_argument(format!("failed to decode InstallSnapshotRequest: {}", e))
            })?;

        let resp = raft
            .raft
            .install_snapshot(raft_req)
            .await
            .map_err(|e| Status::internal(format!("raft InstallSnapshot error: {}", e)))?;

        let payload = serde_json::to_vec(&resp)
            .map_err(|e| Status::internal(format!("failed to encode response: {}", e)))?;

        Ok(Response::new(RaftReply {
            success: true,
            payload,
        }))
    }
}

// ── gRPC server startup ───────────────────────────────────────────────────────

/// Starts the gRPC server on `bind_addr` and serves until the shutdown
/// signal fires. The caller should spawn this in a background task.
pub async fn start_grpc_server(
    bind_addr: String,
    service: JobStoreService,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let addr: SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "invalid grpc bind address");
            return;
        }
    };

    info!(addr = %addr, "grpc server starting");

    let result = Server::builder()
        .add_service(JobStoreServer::new(service))
        .serve_with_shutdown(addr, async move {
            let _ = shutdown_rx.changed().await;
        })
        .await;

    if let Err(e) = result {
        error!(error = %e, "grpc server error");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
