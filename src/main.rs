use std::sync::Arc;

use mimalloc::MiMalloc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use timemachine::cluster_health::ClusterHealth;
use timemachine::config::Config;
use timemachine::connection::ConnectionManager;
use timemachine::coordinator::Coordinator;
use timemachine::dht::Dht;
use timemachine::executor::Executor;
use timemachine::grpc::{start_grpc_server, JobStoreService};
use timemachine::metrics::register_metrics;
use timemachine::node_manager::NodeManager;
use timemachine::publisher::Publisher;
use timemachine::raft::start_raft_node;
use timemachine::rest::{start_rest_server, RestContext};
use timemachine::route_table::RouteTable;
use timemachine::shard_manager::ShardManager;
use timemachine::wal::WalOptions;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        node_id = %config.node_id,
        raft = %config.raft_address(),
        grpc = %config.grpc_address(),
        http = %config.http_address(),
        bootstrap = config.bootstrap,
        "starting timeMachine node"
    );

    register_metrics()?;

    // Shared read-mostly state: placement and routes, both written only by
    // the FSM apply path.
    let dht = Arc::new(Dht::new());
    let routes = Arc::new(RouteTable::new());

    let shards = Arc::new(ShardManager::new(
        config.shard_data_dir(),
        WalOptions {
            max_log_size: config.wal_max_log_size,
            max_segments: config.wal_max_segments,
            max_wait_before_sync: config.wal_max_wait_before_sync,
        },
    ));
    let peers = ConnectionManager::new(config.rpc_timeout);

    let (executor, dispatch_rx) = Executor::start(
        config.executor_grace,
        config.executor_accuracy,
        config.dispatch_buffer,
    );
    let publisher = Publisher::start(
        routes.clone(),
        dispatch_rx,
        config.publisher_count,
        config.request_timeout,
    );

    let (raft, map_gen_rx) = start_raft_node(
        &config.node_id,
        &config.raft_address(),
        dht.clone(),
        routes.clone(),
        config.bootstrap,
    )
    .await;

    let coordinator = Arc::new(Coordinator::new(
        config.node_id.clone(),
        dht.clone(),
        shards.clone(),
        peers.clone(),
        executor.clone(),
        routes.clone(),
        raft.clone(),
    ));

    let node_mgr = NodeManager::new(
        config.node_id.clone(),
        dht.clone(),
        shards.clone(),
        peers.clone(),
        executor.clone(),
        raft.clone(),
    );
    // Pick up state restored from a raft snapshot before serving traffic.
    node_mgr.initialise_node();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let map_watcher = node_mgr.spawn_map_watcher(map_gen_rx, shutdown_rx.clone());
    let minute_poll = node_mgr.spawn_minute_poll(shutdown_rx.clone());

    let health = ClusterHealth::new(
        dht.clone(),
        raft.clone(),
        peers.clone(),
        config.health_poll_interval,
        config.unreachable_threshold,
    )
    .spawn(shutdown_rx.clone());

    let grpc_service =
        JobStoreService::with_parts(config.node_id.clone(), coordinator.clone(), raft.clone());
    let grpc_bind = format!(
        "0.0.0.0:{}",
        config.raft_port + timemachine::address::GRPC_PORT_OFFSET
    );
    tokio::spawn(start_grpc_server(grpc_bind, grpc_service, shutdown_rx.clone()));

    let http_bind = format!(
        "0.0.0.0:{}",
        config.raft_port - timemachine::address::HTTP_PORT_OFFSET
    );
    tokio::spawn(start_rest_server(
        http_bind,
        RestContext {
            coordinator: coordinator.clone(),
            raft: raft.clone(),
        },
        shutdown_rx.clone(),
    ));

    info!("started time machine DB 🐓");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    // Shutdown order: stop accepting HTTP/RPC, drain the executor, wait for
    // the publisher pool, then release connections and storage.
    let _ = shutdown_tx.send(true);
    executor.close().await;
    publisher.wait().await;

    let _ = map_watcher.await;
    let _ = minute_poll.await;
    let _ = health.await;

    peers.close();
    if let Err(e) = shards.close() {
        error!(error = %e, "error closing shard stores");
    }
    if let Err(e) = raft.raft.shutdown().await {
        error!(error = ?e, "error shutting down raft");
    }

    info!("shutdown completed");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
