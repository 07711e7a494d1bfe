use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

const METRIC_NAMESPACE: &str = "time_machine";

lazy_static::lazy_static! {
    // === Data plane ===

    pub static ref JOBS_STORED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("jobs_stored_total", "Jobs accepted and persisted by this node as shard leader")
                .namespace(METRIC_NAMESPACE)
        ).unwrap();

    pub static ref JOBS_DISPATCHED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("jobs_dispatched_total", "Jobs handed from the executor to the dispatch channel")
                .namespace(METRIC_NAMESPACE)
        ).unwrap();

    pub static ref JOBS_PUBLISHED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("jobs_published_total", "Publish attempts by route type and outcome")
                .namespace(METRIC_NAMESPACE),
            &["route_type", "status"]  // status: success, failed
        ).unwrap();

    pub static ref REPLICATION_FAILURES_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("replication_failures_total", "Follower replication RPCs that returned an error")
                .namespace(METRIC_NAMESPACE)
        ).unwrap();

    pub static ref WAL_APPENDS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("wal_appends_total", "Records appended across all shard WALs")
                .namespace(METRIC_NAMESPACE)
        ).unwrap();

    pub static ref DISPATCH_LAG_MS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "dispatch_lag_ms",
                "Delay between a job's trigger time and its dispatch, in milliseconds"
            )
            .namespace(METRIC_NAMESPACE)
            .buckets(vec![10.0, 25.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 5000.0])
        ).unwrap();

    // === Cluster ===

    pub static ref PEER_UNREACHABLE_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("peer_unreachable_total", "Failed health probes by peer node")
                .namespace(METRIC_NAMESPACE),
            &["node_id"]
        ).unwrap();

    pub static ref EXECUTOR_QUEUE_DEPTH: IntGauge =
        IntGauge::with_opts(
            Opts::new("executor_queue_depth", "Entries currently held in the executor's timing queue")
                .namespace(METRIC_NAMESPACE)
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(JOBS_STORED_TOTAL.clone()))?;
    registry.register(Box::new(JOBS_DISPATCHED_TOTAL.clone()))?;
    registry.register(Box::new(JOBS_PUBLISHED_TOTAL.clone()))?;
    registry.register(Box::new(REPLICATION_FAILURES_TOTAL.clone()))?;
    registry.register(Box::new(WAL_APPENDS_TOTAL.clone()))?;
    registry.register(Box::new(DISPATCH_LAG_MS.clone()))?;
    registry.register(Box::new(PEER_UNREACHABLE_TOTAL.clone()))?;
    registry.register(Box::new(EXECUTOR_QUEUE_DEPTH.clone()))?;
    Ok(())
}

/// Gathers and encodes all registered metrics in the Prometheus text format.
pub fn gather_metrics() -> (String, Vec<u8>) {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    (encoder.format_type().to_string(), buffer)
}
