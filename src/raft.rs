//! Raft-backed control plane.
//!
//! Replicates two kinds of state to every node via the `openraft` crate
//! (version 0.9): the shard map (placement truth) and the route table. Each
//! node runs an embedded Raft state machine — no external consensus service
//! required.
//!
//! ## Storage
//!
//! Uses openraft's `Adaptor` to bridge an in-memory combined `RaftStorage`
//! implementation (v1 API) into the v2 `RaftLogStorage` + `RaftStateMachine`
//! split interface required by `Raft::new`. The state machine applies
//! committed commands straight into the shared [`Dht`] and [`RouteTable`]
//! and bumps a `watch` channel so the node manager can react to shard-map
//! generations.
//!
//! ## Transport
//!
//! openraft's `AppendEntries`, `Vote`, and `InstallSnapshot` requests are
//! JSON-serialized and sent over the `JobStore` gRPC service defined in
//! `proto/timemachine.proto`. The proto `payload: bytes` field carries the
//! serialized openraft payload.
//!
//! ## Implementation note on async traits
//!
//! openraft uses RPITIT (return-position impl Trait in Trait) rather than
//! `async_trait::async_trait`. Implementations of these traits must use
//! plain `async fn` — NOT `#[async_trait]` — to match the expected
//! signature.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, ChangeMembers, Entry, LogId, LogState, RaftLogId, Snapshot, SnapshotMeta,
    StorageError, StoredMembership, TokioRuntime, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tonic::transport::{Channel, Endpoint};
use tracing::info;

use crate::address;
use crate::dht::{Dht, ShardMap};
use crate::grpc::proto::job_store_client::JobStoreClient;
use crate::grpc::proto::RaftRequest;
use crate::route::Route;
use crate::route_table::RouteTable;

// ── Type configuration ─────────────────────────────────────────────────────────

/// A control-plane log entry: shard-map replacement or a route change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    ShardMapChange(ShardMap),
    AddRoute(Route),
    RemoveRoute { id: String },
}

/// State machine response after applying a log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub ok: bool,
    pub message: String,
}

/// Raft membership payload for one node: its stable name plus the address
/// every other listener is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub name: String,
    pub raft_addr: String,
}

// The `declare_raft_types!` macro generates the TypeConfig struct and all
// required trait impls (including `Responder` via `OneshotResponder`).
openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Command,
        R            = CommandResponse,
        NodeId       = u64,
        Node         = ClusterNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type RaftNodeId = u64;
pub type RaftInstance = openraft::Raft<TypeConfig>;
pub type ClientWriteFail =
    RaftError<RaftNodeId, openraft::error::ClientWriteError<RaftNodeId, ClusterNode>>;

// ── Utility ───────────────────────────────────────────────────────────────────

/// Derive a stable u64 Raft node ID from the human-readable node name.
pub fn node_id_from_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

// ── In-memory combined storage (openraft v1 RaftStorage) ─────────────────────

#[derive(Serialize, Deserialize)]
struct SnapData {
    shard_map: ShardMap,
    routes: HashMap<String, Route>,
}

/// Combined in-memory Raft storage: log entries + state machine in one
/// struct, wrapped by `Adaptor::new(store)` into the v2 split traits.
///
/// The "state machine" proper lives in the shared [`Dht`] and
/// [`RouteTable`]; applying a committed entry mutates them directly and
/// bumps `map_gen_tx` on shard-map changes so the node manager re-runs its
/// initialisation.
pub struct MemStorage {
    vote: Option<Vote<RaftNodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<RaftNodeId>>,
    last_purged: Option<LogId<RaftNodeId>>,
    last_applied: Option<LogId<RaftNodeId>>,
    last_membership: StoredMembership<RaftNodeId, ClusterNode>,
    snapshot: Option<Snapshot<TypeConfig>>,

    dht: Arc<Dht>,
    routes: Arc<RouteTable>,
    map_generation: u64,
    map_gen_tx: watch::Sender<u64>,
}

impl MemStorage {
    /// Create a new storage bound to the node's DHT and route table,
    /// returning the storage and a `Receiver` that fires on every committed
    /// shard-map change.
    pub fn new(dht: Arc<Dht>, routes: Arc<RouteTable>) -> (Self, watch::Receiver<u64>) {
        let (map_gen_tx, map_gen_rx) = watch::channel(0);
        let storage = Self {
            vote: None,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            snapshot: None,
            dht,
            routes,
            map_generation: 0,
            map_gen_tx,
        };
        (storage, map_gen_rx)
    }

    fn apply_command(&mut self, cmd: &Command) -> CommandResponse {
        match cmd {
            Command::ShardMapChange(map) => {
                self.dht.load(map.clone());
                self.map_generation += 1;
                let _ = self.map_gen_tx.send(self.map_generation);
                info!(
                    shards = map.len(),
                    generation = self.map_generation,
                    "applied shard map from raft log"
                );
                CommandResponse {
                    ok: true,
                    message: format!("shard map applied (generation {})", self.map_generation),
                }
            }
            Command::AddRoute(route) => {
                info!(route_id = %route.id, "applied route add from raft log");
                self.routes.add(route.clone());
                CommandResponse {
                    ok: true,
                    message: format!("route {} added", route.id),
                }
            }
            Command::RemoveRoute { id } => {
                info!(route_id = %id, "applied route remove from raft log");
                self.routes.remove(id);
                CommandResponse {
                    ok: true,
                    message: format!("route {} removed", id),
                }
            }
        }
    }
}

// RaftStorage v1 requires MemStorage to implement RaftLogReader directly
// (because RaftStorage: RaftLogReader). Use plain async fn (no #[async_trait])
// because openraft traits use RPITIT, not boxed futures.
impl RaftLogReader<TypeConfig> for MemStorage {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader backed by a snapshot of the log at a point in time.
pub struct MemLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for MemLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Snapshot builder — serialises the shard map and route table to JSON.
pub struct MemSnapshotBuilder {
    last_applied: Option<LogId<RaftNodeId>>,
    last_membership: StoredMembership<RaftNodeId, ClusterNode>,
    shard_map: ShardMap,
    routes: HashMap<String, Route>,
}

impl RaftSnapshotBuilder<TypeConfig> for MemSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        let data = serde_json::to_vec(&SnapData {
            shard_map: self.shard_map.clone(),
            routes: self.routes.clone(),
        })
        .unwrap_or_default();

        let snap_id = format!(
            "snapshot-{}",
            self.last_applied.map(|l| l.index).unwrap_or(0)
        );

        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_id: self.last_applied,
                last_membership: self.last_membership.clone(),
                snapshot_id: snap_id,
            },
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// openraft v1 `RaftStorage` implementation for `MemStorage`.
impl RaftStorage<TypeConfig> for MemStorage {
    type LogReader = MemLogReader;
    type SnapshotBuilder = MemSnapshotBuilder;

    // ── Vote ──────────────────────────────────────────────────────────────────

    async fn save_vote(&mut self, vote: &Vote<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(self.vote)
    }

    // ── Log ───────────────────────────────────────────────────────────────────

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<RaftNodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<RaftNodeId>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(
        &mut self,
    ) -> Result<Option<LogId<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        MemLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    // ── State machine ─────────────────────────────────────────────────────────

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<RaftNodeId>>,
            StoredMembership<RaftNodeId, ClusterNode>,
        ),
        StorageError<RaftNodeId>,
    > {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<CommandResponse>, StorageError<RaftNodeId>> {
        let mut responses = Vec::new();

        for entry in entries {
            self.last_applied = Some(*entry.get_log_id());

            match &entry.payload {
                openraft::EntryPayload::Blank => {
                    responses.push(CommandResponse {
                        ok: true,
                        message: "noop".to_string(),
                    });
                }
                openraft::EntryPayload::Normal(cmd) => {
                    responses.push(self.apply_command(cmd));
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership =
                        StoredMembership::new(Some(*entry.get_log_id()), m.clone());
                    responses.push(CommandResponse {
                        ok: true,
                        message: "membership change applied".to_string(),
                    });
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        MemSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            shard_map: self.dht.snapshot(),
            routes: self.routes.snapshot(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, ClusterNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let data: SnapData = serde_json::from_slice(snapshot.get_ref()).unwrap_or(SnapData {
            shard_map: ShardMap::new(),
            routes: HashMap::new(),
        });

        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();

        self.routes.load(data.routes);
        if !data.shard_map.is_empty() {
            self.dht.load(data.shard_map);
            self.map_generation += 1;
            let _ = self.map_gen_tx.send(self.map_generation);
        }
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        Ok(self.snapshot.clone())
    }
}

// ── gRPC network transport ─────────────────────────────────────────────────────

/// Per-peer gRPC channel implementing openraft's `RaftNetwork`.
///
/// Serialises openraft request types as JSON and transports them via the
/// proto `payload: bytes` field of the `JobStore` service.
pub struct GrpcNetwork {
    target_addr: String,
    client: Option<JobStoreClient<Channel>>,
}

impl GrpcNetwork {
    fn get_client(&mut self) -> Result<&mut JobStoreClient<Channel>, String> {
        if self.client.is_none() {
            let uri = if self.target_addr.starts_with("http") {
                self.target_addr.clone()
            } else {
                format!("http://{}", self.target_addr)
            };
            // connect_lazy() returns immediately without a blocking TCP
            // handshake; tonic dials on the first RPC and reconnects on
            // failure. Tight timeouts keep heartbeats failing fast instead
            // of stalling into an unnecessary re-election.
            let ch = Endpoint::from_shared(uri)
                .map_err(|e| e.to_string())?
                .connect_timeout(Duration::from_secs(3))
                .timeout(Duration::from_secs(4))
                .connect_lazy();
            self.client = Some(JobStoreClient::new(ch));
        }
        Ok(self.client.as_mut().unwrap())
    }
}

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

impl RaftNetwork<TypeConfig> for GrpcNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<RaftNodeId>,
        RPCError<RaftNodeId, ClusterNode, RaftError<RaftNodeId>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;
        let leader = rpc.vote.leader_id().node_id.to_string();

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .append_entries(RaftRequest {
                term,
                sender_id: leader,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, ClusterNode, RaftError<RaftNodeId>>>
    {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;
        let candidate = rpc.vote.leader_id().node_id.to_string();

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .request_vote(RaftRequest {
                term,
                sender_id: candidate,
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<RaftNodeId, ClusterNode, RaftError<RaftNodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let term = rpc.vote.leader_id().term;

        let client = self
            .get_client()
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        let proto_resp = client
            .install_snapshot(RaftRequest {
                term,
                sender_id: String::new(),
                payload,
            })
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;

        serde_json::from_slice(&proto_resp.into_inner().payload)
            .map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates `GrpcNetwork` instances per target peer node.
pub struct GrpcNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for GrpcNetworkFactory {
    type Network = GrpcNetwork;

    async fn new_client(&mut self, _target: RaftNodeId, node: &ClusterNode) -> Self::Network {
        // Raft rides the peer gRPC listener, derived from the raft address.
        let target_addr =
            address::grpc_address(&node.raft_addr).unwrap_or_else(|| node.raft_addr.clone());
        GrpcNetwork {
            target_addr,
            client: None,
        }
    }
}

// ── RaftNode public API ────────────────────────────────────────────────────────

/// A running Raft node: the consensus handle every other component talks to.
#[derive(Clone)]
pub struct RaftNode {
    pub raft: Arc<RaftInstance>,
    pub node_id: RaftNodeId,
    pub node: ClusterNode,
}

impl RaftNode {
    /// Returns true if this node is the current Raft leader.
    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.node_id)
    }

    /// The current leader's membership payload, if one is known.
    pub fn leader_node(&self) -> Option<ClusterNode> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader_id = metrics.current_leader?;
        let result = metrics
            .membership_config
            .nodes()
            .find(|(id, _)| **id == leader_id)
            .map(|(_, node)| node.clone());
        result
    }

    /// All members of the Raft configuration.
    pub fn membership(&self) -> Vec<(RaftNodeId, ClusterNode)> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .nodes()
            .map(|(id, node)| (*id, node.clone()))
            .collect()
    }

    /// Finds a member's payload by node name.
    pub fn node_by_name(&self, name: &str) -> Option<ClusterNode> {
        self.membership()
            .into_iter()
            .find(|(_, n)| n.name == name)
            .map(|(_, n)| n)
    }

    /// Commits a full shard-map replacement (leader only).
    pub async fn publish_shard_map(&self, map: ShardMap) -> Result<(), ClientWriteFail> {
        self.raft
            .client_write(Command::ShardMapChange(map))
            .await
            .map(|_| ())
    }

    /// Commits a route addition (leader only).
    pub async fn add_route(&self, route: Route) -> Result<(), ClientWriteFail> {
        self.raft
            .client_write(Command::AddRoute(route))
            .await
            .map(|_| ())
    }

    /// Commits a route removal (leader only).
    pub async fn remove_route(&self, id: &str) -> Result<(), ClientWriteFail> {
        self.raft
            .client_write(Command::RemoveRoute { id: id.to_string() })
            .await
            .map(|_| ())
    }

    /// Adds a voter to the Raft configuration (leader only).
    pub async fn join(&self, name: &str, raft_addr: &str) -> Result<(), String> {
        let id = node_id_from_str(name);
        let node = ClusterNode {
            name: name.to_string(),
            raft_addr: raft_addr.to_string(),
        };

        self.raft
            .add_learner(id, node, true)
            .await
            .map_err(|e| e.to_string())?;
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
            .await
            .map_err(|e| e.to_string())?;
        info!(node = name, raft_addr, "added voter to raft configuration");
        Ok(())
    }

    /// Removes a voter from the Raft configuration (leader only).
    pub async fn remove(&self, name: &str) -> Result<(), String> {
        let id = node_id_from_str(name);
        self.raft
            .change_membership(ChangeMembers::RemoveVoters(BTreeSet::from([id])), false)
            .await
            .map_err(|e| e.to_string())?;
        info!(node = name, "removed voter from raft configuration");
        Ok(())
    }

    /// Consensus stats for the REST `/cluster` endpoint.
    pub fn stats(&self) -> serde_json::Value {
        let m = self.raft.metrics().borrow().clone();
        serde_json::json!({
            "id": m.id,
            "node": self.node.name,
            "state": format!("{:?}", m.state),
            "current_term": m.current_term,
            "current_leader": m.current_leader,
            "last_log_index": m.last_log_index,
            "last_applied": m.last_applied.map(|l| l.index),
            "members": self
                .membership()
                .into_iter()
                .map(|(id, n)| serde_json::json!({
                    "id": id,
                    "node_id": n.name,
                    "raft_address": n.raft_addr,
                }))
                .collect::<Vec<_>>(),
        })
    }
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Initialises and starts the Raft node.
///
/// Returns the shared handle plus the `watch` receiver that fires whenever a
/// committed shard-map change lands in the state machine (consumed by the
/// node manager). When `bootstrap` is set the node initialises a fresh
/// single-member cluster; peers join later via the REST `/cluster/join`.
pub async fn start_raft_node(
    name: &str,
    raft_addr: &str,
    dht: Arc<Dht>,
    routes: Arc<RouteTable>,
    bootstrap: bool,
) -> (Arc<RaftNode>, watch::Receiver<u64>) {
    let this_node_id = node_id_from_str(name);
    let this_node = ClusterNode {
        name: name.to_string(),
        raft_addr: raft_addr.to_string(),
    };

    let config = Arc::new(
        openraft::Config {
            cluster_name: "timemachine".to_string(),
            // Generous timeouts so Raft survives fsync pressure from the
            // shard stores sharing the same runtime.
            heartbeat_interval: 500,
            election_timeout_min: 5_000,
            election_timeout_max: 10_000,
            ..Default::default()
        }
        .validate()
        .expect("valid openraft config"),
    );

    let (storage, map_gen_rx) = MemStorage::new(dht, routes);
    let (log_store, state_machine) = Adaptor::new(storage);

    let raft = Arc::new(
        openraft::Raft::new(
            this_node_id,
            config,
            GrpcNetworkFactory,
            log_store,
            state_machine,
        )
        .await
        .expect("failed to create Raft instance"),
    );

    if bootstrap {
        let members = BTreeMap::from([(this_node_id, this_node.clone())]);
        if let Err(e) = raft.initialize(members).await {
            info!(error = %e, "raft already initialised (ignoring on restart)");
        }
    }

    let node = Arc::new(RaftNode {
        raft: raft.clone(),
        node_id: this_node_id,
        node: this_node,
    });

    // Log raft state transitions as they happen.
    {
        let mut rx = raft.metrics();
        let node_name = name.to_string();
        tokio::spawn(async move {
            let mut last_state = None;
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let m = rx.borrow().clone();
                if last_state != Some(m.state) {
                    last_state = Some(m.state);
                    info!(
                        node = %node_name,
                        state = ?m.state,
                        term = m.current_term,
                        leader = ?m.current_leader,
                        "raft state changed"
                    );
                }
            }
        });
    }

    info!(node = name, raft_addr, bootstrap, "raft node started");
    (node, map_gen_rx)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
