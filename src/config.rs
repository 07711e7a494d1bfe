//! Node configuration parsed from environment variables.
//!
//! Only `NODE_ID` is required; everything else has a default so a single
//! node can be started with `NODE_ID=node1 BOOTSTRAP=true ./timemachine`.
//! The HTTP and gRPC listen ports are derived from `RAFT_PORT` (−100 / +200,
//! see `address`).

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Configuration errors with descriptive messages.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("RAFT_PORT must be above {0} so the HTTP port (raft - 100) stays valid")]
    RaftPortTooLow(u16),
}

/// Main configuration for a timeMachine node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stable node identity, unique across the cluster.
    pub node_id: String,

    /// Parent directory for raft state and shard data.
    pub data_dir: String,

    /// Raft listener port; HTTP and gRPC ports are derived from it.
    pub raft_port: u16,

    /// Host peers use to reach this node. Default `127.0.0.1`.
    pub advertise_host: String,

    /// First node of a new cluster starts with `BOOTSTRAP=true`.
    pub bootstrap: bool,

    /// How far ahead the executor accepts jobs directly.
    pub executor_grace: Duration,

    /// Executor tick granularity; bounds dispatch jitter.
    pub executor_accuracy: Duration,

    /// Number of publisher workers draining the dispatch channel.
    pub publisher_count: usize,

    /// Capacity of the bounded dispatch channel.
    pub dispatch_buffer: usize,

    /// Deadline applied to every peer RPC.
    pub rpc_timeout: Duration,

    /// Deadline for webhook POSTs.
    pub request_timeout: Duration,

    /// Cluster-health probe interval (leader only).
    pub health_poll_interval: Duration,

    /// Consecutive failed probes before a peer is demoted.
    pub unreachable_threshold: u32,

    /// WAL segment size cap in bytes.
    pub wal_max_log_size: u64,

    /// WAL segment retention count.
    pub wal_max_segments: usize,

    /// Upper bound on how long an append may stay un-fsynced.
    pub wal_max_wait_before_sync: Duration,
}

/// Helper to get a required environment variable.
fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

/// Helper to parse an environment variable with a default value.
fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Helper to parse a boolean environment variable.
fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .to_lowercase()
        == "true"
}

fn env_millis_or(name: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(env_parse_or(name, default_ms)?))
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = env_required("NODE_ID")?;
        let data_dir = env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());
        let raft_port: u16 = env_parse_or("RAFT_PORT", 8101)?;
        if raft_port <= crate::address::HTTP_PORT_OFFSET {
            return Err(ConfigError::RaftPortTooLow(crate::address::HTTP_PORT_OFFSET));
        }
        let advertise_host =
            env::var("ADVERTISE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let bootstrap = env_bool("BOOTSTRAP", false);

        Ok(Config {
            node_id,
            data_dir,
            raft_port,
            advertise_host,
            bootstrap,
            executor_grace: env_millis_or("EXECUTOR_GRACE_PERIOD_MS", 120_000)?,
            executor_accuracy: env_millis_or("EXECUTOR_ACCURACY_MS", 100)?,
            publisher_count: env_parse_or("PUBLISHER_COUNT", 10)?,
            dispatch_buffer: env_parse_or("DISPATCH_BUFFER", 1024)?,
            rpc_timeout: env_millis_or("RPC_TIMEOUT_MS", 10_000)?,
            request_timeout: env_millis_or("REQUEST_TIMEOUT_MS", 30_000)?,
            health_poll_interval: env_millis_or("HEALTH_POLL_INTERVAL_MS", 10_000)?,
            unreachable_threshold: env_parse_or("UNREACHABLE_THRESHOLD", 2)?,
            wal_max_log_size: env_parse_or("WAL_MAX_LOG_SIZE", 10_000_000)?,
            wal_max_segments: env_parse_or("WAL_MAX_SEGMENTS", 5)?,
            wal_max_wait_before_sync: env_millis_or("WAL_MAX_WAIT_BEFORE_SYNC_MS", 1_000)?,
        })
    }

    /// Raft listener address.
    pub fn raft_address(&self) -> String {
        format!("{}:{}", self.advertise_host, self.raft_port)
    }

    /// gRPC listener address (raft + 200).
    pub fn grpc_address(&self) -> String {
        format!(
            "{}:{}",
            self.advertise_host,
            self.raft_port + crate::address::GRPC_PORT_OFFSET
        )
    }

    /// HTTP listener address (raft − 100).
    pub fn http_address(&self) -> String {
        format!(
            "{}:{}",
            self.advertise_host,
            self.raft_port - crate::address::HTTP_PORT_OFFSET
        )
    }

    /// Shard data directory: `{data_dir}/{node_id}/data`.
    pub fn shard_data_dir(&self) -> String {
        format!("{}/{}/data", self.data_dir, self.node_id)
    }

    /// Create a config for testing purposes.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Config {
            node_id: "test-node".into(),
            data_dir: "data".into(),
            raft_port: 8101,
            advertise_host: "127.0.0.1".into(),
            bootstrap: false,
            executor_grace: Duration::from_secs(120),
            executor_accuracy: Duration::from_millis(100),
            publisher_count: 2,
            dispatch_buffer: 64,
            rpc_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            health_poll_interval: Duration::from_secs(10),
            unreachable_threshold: 2,
            wal_max_log_size: 10_000_000,
            wal_max_segments: 5,
            wal_max_wait_before_sync: Duration::from_secs(1),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
