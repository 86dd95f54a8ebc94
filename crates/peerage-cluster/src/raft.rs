//! Raft consensus for topology changes.
//!
//! Uses openraft to replicate [`TopologyChange`] entries. The state machine
//! is the shared [`TopologyStore`]: each applied entry runs the fencing
//! check against the committed view, so a stale removal is refused on every
//! replica alike.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::io::Cursor;
use std::net::SocketAddr;
use std::ops::RangeBounds;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{
    ClientWriteError, InitializeError, InstallSnapshotError, NetworkError, RPCError, RaftError,
    Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory as RaftNetworkFactoryTrait};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    BasicNode, ChangeMembers, Config, Entry, EntryPayload, LogId, OptionalSend, Raft, RaftMetrics,
    RaftStorage, RaftTypeConfig, ServerState, SnapshotMeta, StorageError, StorageIOError,
    StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::consensus::{ConsensusAdapter, ConsensusError, ConsensusMode, ConsensusStatus};
use crate::raft_transport::{read_frame, write_frame, RaftRpc, RaftRpcResponse};
use crate::status::LivenessTracker;
use crate::store::TopologyStore;
use crate::topology::{ChangeError, ClusterTopology, CommittedEntry, PeerId, TopologyChange};
use crate::ClusterError;

/// Type configuration for openraft.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeConfig;

impl RaftTypeConfig for TypeConfig {
    type D = TopologyChange;
    type R = TopologyResponse;
    type Node = BasicNode;
    type NodeId = u64;
    type Entry = Entry<TypeConfig>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
}

/// Result of applying one log entry to the topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TopologyResponse {
    /// The change produced this topology version.
    Committed { version: u64 },
    /// The change was not applicable; the topology is unchanged.
    Refused { version: u64, error: ChangeError },
    /// Blank and membership entries.
    Noop,
}

/// State machine snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopologySnapshot {
    pub last_applied: Option<LogId<u64>>,
    pub last_membership: StoredMembership<u64, BasicNode>,
    pub topology: ClusterTopology,
}

/// Timing knobs for the raft engine, in milliseconds.
#[derive(Debug, Clone)]
pub struct RaftSettings {
    pub cluster_name: String,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Interval between liveness pings to every other raft member.
    pub liveness_probe_interval_ms: u64,
}

impl Default for RaftSettings {
    fn default() -> Self {
        Self {
            cluster_name: "peerage".to_string(),
            heartbeat_interval_ms: 500,
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
            liveness_probe_interval_ms: 1000,
        }
    }
}

/// Combined log and state machine storage for raft.
///
/// The log lives in memory; the state machine is the [`TopologyStore`]
/// shared with the rest of the node.
#[derive(Debug)]
pub struct Storage {
    vote: RwLock<Option<Vote<u64>>>,
    log: RwLock<BTreeMap<u64, Entry<TypeConfig>>>,
    last_purged: RwLock<Option<LogId<u64>>>,
    last_applied: RwLock<Option<LogId<u64>>>,
    last_membership: RwLock<StoredMembership<u64, BasicNode>>,
    snapshot: RwLock<Option<StoredSnapshot>>,
    topology: Arc<TopologyStore>,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<u64, BasicNode>,
    data: Vec<u8>,
}

impl Storage {
    pub fn new(topology: Arc<TopologyStore>) -> Arc<Self> {
        Arc::new(Self {
            vote: RwLock::new(None),
            log: RwLock::new(BTreeMap::new()),
            last_purged: RwLock::new(None),
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
            snapshot: RwLock::new(None),
            topology,
        })
    }

    pub fn topology(&self) -> &Arc<TopologyStore> {
        &self.topology
    }

    fn apply_change(
        &self,
        log_id: LogId<u64>,
        change: &TopologyChange,
    ) -> Result<TopologyResponse, StorageError<u64>> {
        let view = self
            .topology
            .current_view()
            .map_err(|e| StorageIOError::apply(log_id, &e))?;

        if let Err(error) = view.check(change) {
            debug!(index = log_id.index, "refused {change}: {error}");
            return Ok(TopologyResponse::Refused {
                version: view.version(),
                error,
            });
        }

        let entry = CommittedEntry {
            version: view.version() + 1,
            change: change.clone(),
        };
        let next = self
            .topology
            .apply(&entry)
            .map_err(|e| StorageIOError::apply(log_id, &e))?;
        Ok(TopologyResponse::Committed {
            version: next.version(),
        })
    }
}

impl RaftLogReader<TypeConfig> for Arc<Storage> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, v)| v.clone()).collect())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<Storage> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();
        let topology = self
            .topology
            .current_view()
            .map(|view| (*view).clone())
            .unwrap_or_default();

        let snapshot = TopologySnapshot {
            last_applied,
            last_membership: membership.clone(),
            topology,
        };
        let data =
            serde_json::to_vec(&snapshot).map_err(|e| StorageIOError::write_snapshot(None, &e))?;

        let snapshot_id = last_applied
            .map(|id| format!("{}-{}", id.leader_id, id.index))
            .unwrap_or_else(|| "0-0".to_string());

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for Arc<Storage> {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        let log = self.log.read().await;
        let last = log.iter().next_back().map(|(_, e)| e.log_id);
        let purged = *self.last_purged.read().await;

        Ok(LogState {
            last_purged_log_id: purged,
            last_log_id: last.or(purged),
        })
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Arc::clone(self)
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<u64>,
    ) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        log.split_off(&log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        *log = log.split_off(&(log_id.index + 1));
        *self.last_purged.write().await = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<TopologyResponse>, StorageError<u64>> {
        // the first applied entry seeds an empty topology
        if !self.topology.is_initialized() {
            self.topology.initialize(ClusterTopology::empty());
        }

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            *self.last_applied.write().await = Some(entry.log_id);

            match &entry.payload {
                EntryPayload::Blank => results.push(TopologyResponse::Noop),
                EntryPayload::Normal(change) => {
                    results.push(self.apply_change(entry.log_id, change)?);
                }
                EntryPayload::Membership(m) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), m.clone());
                    results.push(TopologyResponse::Noop);
                }
            }
        }
        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let data = snapshot.into_inner();
        let snap: TopologySnapshot = serde_json::from_slice(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        *self.last_applied.write().await = snap.last_applied;
        *self.last_membership.write().await = snap.last_membership;
        info!(
            version = snap.topology.version(),
            "installing topology snapshot"
        );
        self.topology.initialize(snap.topology);

        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        let snap = self.snapshot.read().await;
        Ok(snap.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

// -- network implementation --

/// Per-peer network handle. Opens a short-lived TCP connection per RPC call.
pub struct RaftNetworkClient {
    target: PeerId,
    addr: String,
    liveness: Arc<LivenessTracker>,
}

impl RaftNetwork<TypeConfig> for RaftNetworkClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        match self.call(RaftRpc::AppendEntries(rpc)).await? {
            RaftRpcResponse::AppendEntries(r) => Ok(r),
            _ => Err(unexpected_response()),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        match self.call(RaftRpc::Vote(rpc)).await? {
            RaftRpcResponse::Vote(r) => Ok(r),
            _ => Err(unexpected_response()),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        let resp = self
            .send_rpc(RaftRpc::InstallSnapshot(rpc))
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;
        match resp {
            RaftRpcResponse::InstallSnapshot(r) => Ok(r),
            _ => Err(unexpected_response()),
        }
    }
}

impl RaftNetworkClient {
    async fn call(
        &self,
        rpc: RaftRpc,
    ) -> Result<RaftRpcResponse, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.send_rpc(rpc)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))
    }

    /// Sends one frame, reads one frame, and records the peer as alive.
    async fn send_rpc(&self, rpc: RaftRpc) -> std::io::Result<RaftRpcResponse> {
        let mut stream = TcpStream::connect(self.addr.as_str()).await?;
        write_frame(&mut stream, &rpc).await?;
        let resp = read_frame(&mut stream).await?;
        self.liveness.observe(self.target);
        Ok(resp)
    }
}

fn unexpected_response<E: std::error::Error>() -> RPCError<u64, BasicNode, E> {
    RPCError::Network(NetworkError::new(&std::io::Error::other(
        "unexpected response variant",
    )))
}

/// Creates per-peer [`RaftNetworkClient`]s.
///
/// `BasicNode::addr` holds the peer's raft address, `host:port`.
pub struct RaftNetworkFactory {
    liveness: Arc<LivenessTracker>,
}

impl RaftNetworkFactoryTrait<TypeConfig> for RaftNetworkFactory {
    type Network = RaftNetworkClient;

    async fn new_client(&mut self, target: u64, node: &BasicNode) -> RaftNetworkClient {
        RaftNetworkClient {
            target: PeerId(target),
            addr: node.addr.clone(),
            liveness: Arc::clone(&self.liveness),
        }
    }
}

// -- TCP listener for inbound raft RPCs --

/// Spawns a task that accepts incoming raft RPC connections.
///
/// Reads one `RaftRpc` frame, dispatches to the local raft instance,
/// writes one `RaftRpcResponse` frame, then closes the connection.
fn spawn_raft_listener(
    raft: Raft<TypeConfig>,
    listener: TcpListener,
    liveness: Arc<LivenessTracker>,
) {
    tokio::spawn(async move {
        loop {
            let (mut stream, remote) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("raft accept error: {e}");
                    continue;
                }
            };

            let raft = raft.clone();
            let liveness = Arc::clone(&liveness);
            tokio::spawn(async move {
                let rpc: RaftRpc = match read_frame(&mut stream).await {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("raft read error from {remote}: {e}");
                        return;
                    }
                };

                let response = match rpc {
                    RaftRpc::AppendEntries(req) => {
                        let sender = req.vote.leader_id().voted_for();
                        match raft.append_entries(req).await {
                            Ok(r) => {
                                if let Some(id) = sender {
                                    liveness.observe(PeerId(id));
                                }
                                RaftRpcResponse::AppendEntries(r)
                            }
                            Err(e) => {
                                debug!("append_entries error: {e}");
                                return;
                            }
                        }
                    }
                    RaftRpc::Vote(req) => {
                        let sender = req.vote.leader_id().voted_for();
                        match raft.vote(req).await {
                            Ok(r) => {
                                if let Some(id) = sender {
                                    liveness.observe(PeerId(id));
                                }
                                RaftRpcResponse::Vote(r)
                            }
                            Err(e) => {
                                debug!("vote error: {e}");
                                return;
                            }
                        }
                    }
                    RaftRpc::InstallSnapshot(req) => {
                        // topology snapshots fit in one chunk
                        let snapshot = Snapshot {
                            meta: req.meta,
                            snapshot: Box::new(Cursor::new(req.data)),
                        };
                        match raft.install_full_snapshot(req.vote, snapshot).await {
                            Ok(r) => RaftRpcResponse::InstallSnapshot(InstallSnapshotResponse {
                                vote: r.vote,
                            }),
                            Err(e) => {
                                debug!("install_snapshot error: {e}");
                                return;
                            }
                        }
                    }
                    RaftRpc::Propose(change) => {
                        // forwarded once only; a moved leader is reported, not chased
                        let result = write_local(&raft, change).await.map_err(|e| match e {
                            WriteError::Consensus(e) => e,
                            WriteError::NotLeader { leader, .. } => not_leader(leader),
                        });
                        RaftRpcResponse::Propose(result)
                    }
                    RaftRpc::Ping { from } => {
                        liveness.observe(from);
                        RaftRpcResponse::Pong
                    }
                };

                if let Err(e) = write_frame(&mut stream, &response).await {
                    debug!("raft write error to {remote}: {e}");
                }
            });
        }
    });
}

/// Spawns a task that pings every other raft member each `every`.
///
/// Raft traffic alone only connects the leader with each follower; the
/// pings give every node a fresh heartbeat for every member. The task ends
/// when raft shuts down.
fn spawn_liveness_probes(
    mut metrics: watch::Receiver<RaftMetrics<u64, BasicNode>>,
    local_id: PeerId,
    liveness: Arc<LivenessTracker>,
    every: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if metrics.has_changed().is_err() {
                return;
            }

            let targets: Vec<(PeerId, String)> = metrics
                .borrow_and_update()
                .membership_config
                .membership()
                .nodes()
                .filter(|(id, _)| **id != local_id.0)
                .map(|(id, node)| (PeerId(*id), node.addr.clone()))
                .collect();

            for (peer, addr) in targets {
                let liveness = Arc::clone(&liveness);
                tokio::spawn(async move {
                    match tokio::time::timeout(every, ping(&addr, local_id)).await {
                        Ok(Ok(())) => liveness.observe(peer),
                        Ok(Err(e)) => debug!(%peer, "liveness probe failed: {e}"),
                        Err(_) => debug!(%peer, "liveness probe timed out"),
                    }
                });
            }
        }
    });
}

async fn ping(addr: &str, from: PeerId) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    write_frame(&mut stream, &RaftRpc::Ping { from }).await?;
    match read_frame(&mut stream).await? {
        RaftRpcResponse::Pong => Ok(()),
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected response to ping",
        )),
    }
}

/// Why the local raft node could not take a write.
enum WriteError {
    /// Another member leads, or nobody does yet.
    NotLeader {
        leader: Option<PeerId>,
        addr: Option<String>,
    },
    Consensus(ConsensusError),
}

fn not_leader(leader: Option<PeerId>) -> ConsensusError {
    ConsensusError::Unavailable(match leader {
        Some(leader) => format!("not leader, leader is peer {leader}"),
        None => "no leader elected".to_string(),
    })
}

/// Writes `change` through the local raft node. Returns once the entry is
/// applied here, which only happens on the leader.
async fn write_local(
    raft: &Raft<TypeConfig>,
    change: TopologyChange,
) -> Result<CommittedEntry, WriteError> {
    let resp = raft
        .client_write(change.clone())
        .await
        .map_err(|e| match e {
            RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)) => WriteError::NotLeader {
                leader: fwd.leader_id.map(PeerId),
                addr: fwd.leader_node.map(|node| node.addr),
            },
            other => WriteError::Consensus(ConsensusError::Unavailable(other.to_string())),
        })?;

    match resp.data {
        TopologyResponse::Committed { version } => {
            if let TopologyChange::RemovePeer { peer_id, .. } = &change {
                spawn_voter_retirement(raft.clone(), *peer_id);
            }
            Ok(CommittedEntry { version, change })
        }
        TopologyResponse::Refused { error, .. } => Err(WriteError::Consensus(error.into())),
        TopologyResponse::Noop => Err(WriteError::Consensus(ConsensusError::Unavailable(
            "raft returned no result for a topology change".to_string(),
        ))),
    }
}

/// Sends `change` to the leader's raft listener and waits for its verdict.
async fn forward_proposal(
    addr: &str,
    change: TopologyChange,
) -> Result<CommittedEntry, ConsensusError> {
    let unreachable =
        |e: std::io::Error| ConsensusError::Unavailable(format!("leader at {addr}: {e}"));

    let mut stream = TcpStream::connect(addr).await.map_err(unreachable)?;
    write_frame(&mut stream, &RaftRpc::Propose(change))
        .await
        .map_err(unreachable)?;
    match read_frame(&mut stream).await.map_err(unreachable)? {
        RaftRpcResponse::Propose(result) => result,
        _ => Err(ConsensusError::Unavailable(format!(
            "unexpected response from leader at {addr}"
        ))),
    }
}

/// Drops a removed peer from the raft voter set in the background.
///
/// The topology removal is already committed. The membership change may
/// wait on an unreachable quorum, so nothing waits for it.
fn spawn_voter_retirement(raft: Raft<TypeConfig>, peer: PeerId) {
    tokio::spawn(async move {
        let is_member = raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .get_node(&peer.0)
            .is_some();
        if !is_member {
            return;
        }

        let remove = BTreeSet::from([peer.0]);
        match raft
            .change_membership(ChangeMembers::RemoveVoters(remove), false)
            .await
        {
            Ok(_) => info!(%peer, "removed from raft membership"),
            Err(e) => warn!(%peer, "failed to remove from raft membership: {e}"),
        }
    });
}

// -- consensus adapter --

/// Replicated consensus over openraft.
///
/// Proposals go through `client_write` on the leader. A follower forwards
/// them to the leader's listener and then waits until the committed entry
/// reaches its own [`TopologyStore`], so `propose` always returns after the
/// local apply.
pub struct RaftConsensus {
    raft: Raft<TypeConfig>,
    local_id: PeerId,
    raft_addr: SocketAddr,
    topology: Arc<TopologyStore>,
}

impl RaftConsensus {
    /// Starts a raft node listening on `bind_addr`.
    ///
    /// Binds the RPC listener before returning so a taken port is reported
    /// to the caller.
    pub async fn start(
        local_id: PeerId,
        bind_addr: SocketAddr,
        settings: &RaftSettings,
        topology: Arc<TopologyStore>,
        liveness: Arc<LivenessTracker>,
    ) -> Result<Self, ClusterError> {
        let config = Config {
            cluster_name: settings.cluster_name.clone(),
            heartbeat_interval: settings.heartbeat_interval_ms,
            election_timeout_min: settings.election_timeout_min_ms,
            election_timeout_max: settings.election_timeout_max_ms,
            ..Config::default()
        }
        .validate()
        .map_err(|e| ClusterError::Configuration(e.to_string()))?;

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ClusterError::Raft(format!("failed to bind {bind_addr}: {e}")))?;
        let raft_addr = listener
            .local_addr()
            .map_err(|e| ClusterError::Raft(e.to_string()))?;

        let storage = Storage::new(Arc::clone(&topology));
        let (log_store, state_machine) = Adaptor::new(storage);
        let network = RaftNetworkFactory {
            liveness: Arc::clone(&liveness),
        };

        let raft = Raft::new(local_id.0, Arc::new(config), network, log_store, state_machine)
            .await
            .map_err(|e| ClusterError::Raft(e.to_string()))?;

        spawn_raft_listener(raft.clone(), listener, Arc::clone(&liveness));
        spawn_liveness_probes(
            raft.metrics(),
            local_id,
            liveness,
            Duration::from_millis(settings.liveness_probe_interval_ms),
        );
        info!(peer_id = %local_id, "raft listener on {raft_addr}");

        Ok(Self {
            raft,
            local_id,
            raft_addr,
            topology,
        })
    }

    /// Initializes the raft group with `members` as voters.
    ///
    /// Only one member should call this, on first boot. Calling it on a
    /// node that already has log state is a no-op.
    pub async fn initialize(&self, members: &BTreeMap<PeerId, String>) -> Result<(), ClusterError> {
        let nodes: BTreeMap<u64, BasicNode> = members
            .iter()
            .map(|(id, addr)| (id.0, BasicNode::new(addr)))
            .collect();

        match self.raft.initialize(nodes).await {
            Ok(()) => {
                info!(members = members.len(), "raft group initialized");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!("raft group already initialized");
                Ok(())
            }
            Err(e) => Err(ClusterError::Raft(e.to_string())),
        }
    }

    /// Waits until some member is known to lead.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<PeerId, ClusterError> {
        let metrics = self
            .raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|_| ClusterError::Timeout)?;
        metrics.current_leader.map(PeerId).ok_or(ClusterError::Timeout)
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().state == ServerState::Leader
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Address the RPC listener is bound to.
    pub fn raft_addr(&self) -> SocketAddr {
        self.raft_addr
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!("raft shutdown failed: {e}");
        }
    }

    /// Waits until the local store has applied `version`.
    async fn wait_applied(&self, version: u64) -> Result<(), ConsensusError> {
        let mut rx = self.topology.subscribe();
        rx.wait_for(|view| view.as_ref().is_some_and(|v| v.version() >= version))
            .await
            .map(|_| ())
            .map_err(|_| ConsensusError::Unavailable("topology store closed".to_string()))
    }
}

impl ConsensusAdapter for RaftConsensus {
    async fn propose(&self, change: TopologyChange) -> Result<CommittedEntry, ConsensusError> {
        match write_local(&self.raft, change.clone()).await {
            Ok(entry) => Ok(entry),
            Err(WriteError::Consensus(e)) => Err(e),
            Err(WriteError::NotLeader {
                leader: Some(leader),
                addr: Some(addr),
            }) => {
                debug!(%leader, "forwarding {change} to the leader");
                let entry = forward_proposal(&addr, change).await?;
                self.wait_applied(entry.version).await?;
                Ok(entry)
            }
            Err(WriteError::NotLeader { leader, .. }) => Err(not_leader(leader)),
        }
    }

    fn status(&self) -> ConsensusStatus {
        let m = self.raft.metrics().borrow().clone();
        let role = match m.state {
            ServerState::Leader => "leader",
            ServerState::Follower => "follower",
            ServerState::Candidate => "candidate",
            ServerState::Learner => "learner",
            ServerState::Shutdown => "shutdown",
        };
        ConsensusStatus {
            mode: ConsensusMode::Raft,
            role: role.to_string(),
            leader: m.current_leader.map(PeerId),
            term: m.current_term,
            last_applied: m.last_applied.map(|id| id.index),
        }
    }
}
