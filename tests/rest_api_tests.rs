//! The REST surface of a single-node cluster, driven over real HTTP:
//! configure, route CRUD, job CRUD, and the write → fire → webhook flow.

use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tempfile::tempdir;
use tokio::sync::watch;
use tokio::time::sleep;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use timemachine::connection::ConnectionManager;
use timemachine::coordinator::Coordinator;
use timemachine::dht::Dht;
use timemachine::executor::Executor;
use timemachine::job::current_millis;
use timemachine::node_manager::NodeManager;
use timemachine::publisher::Publisher;
use timemachine::raft::start_raft_node;
use timemachine::rest::{start_rest_server, RestContext};
use timemachine::route_table::RouteTable;
use timemachine::shard_manager::ShardManager;
use timemachine::wal::WalOptions;

struct TestNode {
    base_url: String,
    shutdown_tx: watch::Sender<bool>,
    executor: Arc<Executor>,
    publisher: Publisher,
}

/// Boots a full single-node cluster with its REST listener on `http_port`.
async fn start_node(data_dir: &std::path::Path, http_port: u16) -> TestNode {
    let dht = Arc::new(Dht::new());
    let routes = Arc::new(RouteTable::new());
    let shards = Arc::new(ShardManager::new(data_dir, WalOptions::default()));
    let peers = ConnectionManager::new(Duration::from_secs(1));

    let (executor, dispatch_rx) =
        Executor::start(Duration::from_secs(5), Duration::from_millis(50), 64);
    let publisher = Publisher::start(routes.clone(), dispatch_rx, 2, Duration::from_secs(2));

    let raft_addr = format!("127.0.0.1:{}", http_port + 100);
    let (raft, map_gen_rx) =
        start_raft_node("node1", &raft_addr, dht.clone(), routes.clone(), true).await;

    for _ in 0..200 {
        if raft.is_leader() {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }
    assert!(raft.is_leader(), "node never became raft leader");

    let coordinator = Arc::new(Coordinator::new(
        "node1".to_string(),
        dht.clone(),
        shards.clone(),
        peers.clone(),
        executor.clone(),
        routes.clone(),
        raft.clone(),
    ));

    let node_mgr = NodeManager::new(
        "node1".to_string(),
        dht,
        shards,
        peers,
        executor.clone(),
        raft.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    node_mgr.spawn_map_watcher(map_gen_rx, shutdown_rx.clone());

    let bind = format!("127.0.0.1:{}", http_port);
    tokio::spawn(start_rest_server(
        bind.clone(),
        RestContext {
            coordinator,
            raft,
        },
        shutdown_rx,
    ));

    // Give the listener a beat to bind.
    sleep(Duration::from_millis(200)).await;

    TestNode {
        base_url: format!("http://{}", bind),
        shutdown_tx,
        executor,
        publisher,
    }
}

impl TestNode {
    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.executor.close().await;
        self.publisher.wait().await;
    }
}

#[tokio::test]
#[serial]
async fn rest_surface_round_trip() {
    let data_dir = tempdir().unwrap();
    let node = start_node(data_dir.path(), 18001).await;
    let client = reqwest::Client::new();
    let base = &node.base_url;

    // Liveness.
    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    // Consensus stats report this node as leader.
    let stats: serde_json::Value = client
        .get(format!("{}/cluster", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["state"], "Leader");

    // Configure the shard map across the current membership.
    let resp = client
        .post(format!("{}/cluster/configure", base))
        .json(&serde_json::json!({"shards": 12, "replicas": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    // Let the map watcher open the shard stores.
    sleep(Duration::from_millis(300)).await;

    let servers: serde_json::Value = client
        .get(format!("{}/cluster/servers", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(servers["servers"][0]["node_id"], "node1");

    // Register the webhook route.
    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cb"))
        .and(body_json(serde_json::json!({"foo": "bar"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&webhook)
        .await;

    let resp = client
        .post(format!("{}/route", base))
        .json(&serde_json::json!({
            "id": "R1",
            "type": "http",
            "webhook_url": format!("{}/cb", webhook.uri()),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let route: serde_json::Value = client
        .get(format!("{}/route/R1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(route["type"], "http");

    // Write a job due shortly; the offset is the shard's first WAL record.
    let trigger_ms = current_millis() + 1_500;
    let resp: serde_json::Value = client
        .post(format!("{}/job/default", base))
        .json(&serde_json::json!({
            "id": "job-1",
            "trigger_ms": trigger_ms,
            "meta": {"foo": "bar"},
            "route": "R1",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["offset"], 0);

    // Read it back unchanged.
    let job: serde_json::Value = client
        .get(format!("{}/job/default/job-1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(job["id"], "job-1");
    assert_eq!(job["trigger_ms"], trigger_ms);
    assert_eq!(job["meta"], serde_json::json!({"foo": "bar"}));

    // The webhook fires exactly once around the trigger time.
    sleep(Duration::from_millis(3_000)).await;
    assert_eq!(webhook.received_requests().await.unwrap().len(), 1);

    // The durable copy survives the dispatch until explicitly deleted.
    let resp: serde_json::Value = client
        .delete(format!("{}/job/default/job-1", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "ok");

    let resp = client
        .get(format!("{}/job/default/job-1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Route teardown.
    let resp = client
        .delete(format!("{}/route/R1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.get(format!("{}/route/R1", base)).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    node.stop().await;
}

#[tokio::test]
#[serial]
async fn rest_rejects_bad_requests() {
    let data_dir = tempdir().unwrap();
    let node = start_node(data_dir.path(), 18201).await;
    let client = reqwest::Client::new();
    let base = &node.base_url;

    // Writes before the shard map exists are refused.
    let resp = client
        .post(format!("{}/job/default", base))
        .json(&serde_json::json!({
            "id": "early",
            "trigger_ms": current_millis() + 60_000,
            "meta": {},
            "route": "R1",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Invalid configure parameters.
    let resp = client
        .post(format!("{}/cluster/configure", base))
        .json(&serde_json::json!({"shards": 12, "replicas": 5}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Malformed route.
    let resp = client
        .post(format!("{}/route", base))
        .json(&serde_json::json!({"id": "R9", "type": "http"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Unknown paths.
    let resp = client.get(format!("{}/nope", base)).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    // Join without a node id.
    let resp = client
        .post(format!("{}/cluster/join", base))
        .json(&serde_json::json!({"raft_address": "127.0.0.1:9999"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    node.stop().await;
}
