//! REST surface: control plane (cluster membership, shard-map configure)
//! and data plane (jobs, routes) as thin adapters over the coordinator.
//!
//! | Endpoint                        | Action                                  |
//! |---------------------------------|-----------------------------------------|
//! | `GET /health`                   | liveness                                |
//! | `GET /metrics`                  | Prometheus text exposition              |
//! | `GET /cluster`                  | consensus stats                         |
//! | `POST /cluster/join`            | add a Raft voter (leader only)          |
//! | `POST /cluster/remove`          | remove a Raft voter (leader only)       |
//! | `POST /cluster/configure`       | build + replicate the initial shard map |
//! | `GET /cluster/servers`          | list Raft members                       |
//! | `GET/POST/DELETE /job/...`      | job CRUD via the coordinator            |
//! | `GET/POST/DELETE /route/...`    | route CRUD via the coordinator          |
//!
//! Errors come back as `400 {"error": "..."}`; leader-only endpoints called
//! elsewhere also report the current leader's HTTP address.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::address;
use crate::coordinator::Coordinator;
use crate::dht;
use crate::job::Job;
use crate::metrics::gather_metrics;
use crate::raft::RaftNode;
use crate::route::Route;

#[derive(Clone)]
pub struct RestContext {
    pub coordinator: Arc<Coordinator>,
    pub raft: Arc<RaftNode>,
}

#[derive(Deserialize)]
struct ClusterMessage {
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    raft_address: String,
}

#[derive(Deserialize)]
struct ConfigureMessage {
    shards: u64,
    replicas: usize,
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_default()
}

fn ok(value: serde_json::Value) -> Response<Body> {
    json_response(StatusCode::OK, value)
}

fn bad_request(message: impl std::fmt::Display) -> Response<Body> {
    json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({ "error": message.to_string() }),
    )
}

fn not_found() -> Response<Body> {
    json_response(
        StatusCode::NOT_FOUND,
        serde_json::json!({ "error": "not found" }),
    )
}

/// 400 telling the caller who the leader is, mirroring the join contract.
fn not_leader(ctx: &RestContext) -> Response<Body> {
    let leader = ctx
        .raft
        .leader_node()
        .and_then(|n| address::http_address(&n.raft_addr));
    json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({ "error": "not leader", "leader": leader }),
    )
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, String> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| e.to_string())?;
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

async fn handle(req: Request<Body>, ctx: RestContext) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().trim_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    debug!(method = %method, path = %path, "rest request");

    match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => ok(serde_json::json!({ "status": "ok" })),

        (&Method::GET, ["metrics"]) => {
            let (content_type, body) = gather_metrics();
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", content_type)
                .body(Body::from(body))
                .unwrap_or_default()
        }

        // ── Cluster ───────────────────────────────────────────────────────
        (&Method::GET, ["cluster"]) => ok(ctx.raft.stats()),

        (&Method::GET, ["cluster", "servers"]) => {
            let servers: Vec<serde_json::Value> = ctx
                .raft
                .membership()
                .into_iter()
                .map(|(_, node)| {
                    serde_json::json!({
                        "node_id": node.name,
                        "raft_address": node.raft_addr,
                    })
                })
                .collect();
            ok(serde_json::json!({ "servers": servers }))
        }

        (&Method::POST, ["cluster", "join"]) => {
            let msg: ClusterMessage = match read_json(req).await {
                Ok(msg) => msg,
                Err(e) => return bad_request(e),
            };
            if msg.node_id.is_empty() || msg.raft_address.is_empty() {
                return bad_request("invalid node_id or raft_address");
            }
            if !ctx.raft.is_leader() {
                return not_leader(&ctx);
            }
            match ctx.raft.join(&msg.node_id, &msg.raft_address).await {
                Ok(()) => ok(serde_json::json!({ "status": "ok" })),
                Err(e) => bad_request(e),
            }
        }

        (&Method::POST, ["cluster", "remove"]) => {
            let msg: ClusterMessage = match read_json(req).await {
                Ok(msg) => msg,
                Err(e) => return bad_request(e),
            };
            if msg.node_id.is_empty() {
                return bad_request("invalid node_id");
            }
            if !ctx.raft.is_leader() {
                return not_leader(&ctx);
            }
            match ctx.raft.remove(&msg.node_id).await {
                Ok(()) => ok(serde_json::json!({ "status": "ok" })),
                Err(e) => bad_request(e),
            }
        }

        (&Method::POST, ["cluster", "configure"]) => {
            let msg: ConfigureMessage = match read_json(req).await {
                Ok(msg) => msg,
                Err(e) => return bad_request(e),
            };
            if !ctx.raft.is_leader() {
                return not_leader(&ctx);
            }

            let mut nodes: Vec<String> = ctx
                .raft
                .membership()
                .into_iter()
                .map(|(_, node)| node.name)
                .collect();
            nodes.sort();

            let map = match dht::bootstrap(msg.shards, &nodes, msg.replicas) {
                Ok(map) => map,
                Err(e) => return bad_request(e),
            };
            match ctx.raft.publish_shard_map(map).await {
                Ok(()) => ok(serde_json::json!({
                    "status": "ok",
                    "shards": msg.shards,
                    "replicas": msg.replicas,
                    "nodes": nodes,
                })),
                Err(e) => bad_request(e),
            }
        }

        // ── Jobs ──────────────────────────────────────────────────────────
        (&Method::GET, ["job", collection, job_id]) => {
            match ctx.coordinator.get(*collection, *job_id).await {
                Ok(job) => ok(serde_json::to_value(&job).unwrap_or_default()),
                Err(e) => bad_request(e),
            }
        }

        (&Method::POST, ["job", collection]) => {
            let collection = collection.to_string();
            let job: Job = match read_json(req).await {
                Ok(job) => job,
                Err(e) => return bad_request(e),
            };
            match ctx.coordinator.set(&collection, &job).await {
                Ok(offset) => {
                    debug!(collection = %collection, job_id = %job.id, offset, "job set");
                    ok(serde_json::json!({ "status": "ok", "offset": offset }))
                }
                Err(e) => bad_request(e),
            }
        }

        (&Method::DELETE, ["job", collection, job_id]) => {
            match ctx.coordinator.delete(*collection, *job_id).await {
                Ok(offset) => ok(serde_json::json!({ "status": "ok", "offset": offset })),
                Err(e) => bad_request(e),
            }
        }

        // ── Routes ────────────────────────────────────────────────────────
        (&Method::GET, ["route", route_id]) => match ctx.coordinator.get_route(*route_id) {
            Ok(route) => ok(serde_json::to_value(&route).unwrap_or_default()),
            Err(e) => bad_request(e),
        },

        (&Method::POST, ["route"]) => {
            let route: Route = match read_json(req).await {
                Ok(route) => route,
                Err(e) => return bad_request(e),
            };
            match ctx.coordinator.set_route(route).await {
                Ok(()) => ok(serde_json::json!({ "status": "ok" })),
                Err(e) => bad_request(e),
            }
        }

        (&Method::DELETE, ["route", route_id]) => {
            match ctx.coordinator.delete_route(*route_id).await {
                Ok(()) => ok(serde_json::json!({ "status": "ok" })),
                Err(e) => bad_request(e),
            }
        }

        _ => not_found(),
    }
}

/// Starts the REST server on `bind_addr` and serves until the shutdown
/// signal fires. The caller should spawn this in a background task.
pub async fn start_rest_server(
    bind_addr: String,
    ctx: RestContext,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) {
    let addr: SocketAddr = match bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "invalid http bind address");
            return;
        }
    };

    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, hyper::Error>(handle(req, ctx).await) }
            }))
        }
    });

    info!(addr = %addr, "http server starting");

    let server = Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });

    if let Err(e) = server.await {
        error!(error = %e, "http server error");
    }
}
