//! Node lifecycle: consensus selection, startup seeding, member admission
//! and graceful departure.

use std::sync::Arc;
use std::time::Duration;

use peerage_cluster::{
    spawn_liveness_pruning, ClusterError, CommittedEntry, ConsensusAdapter, ConsensusError,
    ConsensusStatus, LivenessTracker, LocalConsensus, PeerId, PeerState, RaftConsensus, ShardMap,
    TopologyChange, TopologyStore,
};
use tracing::{debug, info, warn};

use crate::config::{ClusterMode, PeerageConfig};

/// How long a departing node waits for its `MarkLeaving` to commit.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(3);

/// The consensus implementation chosen by `cluster.mode`.
pub enum Consensus {
    Local(LocalConsensus),
    Raft(RaftConsensus),
}

impl ConsensusAdapter for Consensus {
    async fn propose(&self, change: TopologyChange) -> Result<CommittedEntry, ConsensusError> {
        match self {
            Consensus::Local(c) => c.propose(change).await,
            Consensus::Raft(c) => c.propose(change).await,
        }
    }

    fn status(&self) -> ConsensusStatus {
        match self {
            Consensus::Local(c) => c.status(),
            Consensus::Raft(c) => c.status(),
        }
    }
}

/// Shared handles of a running node.
pub struct Node {
    pub local_id: PeerId,
    pub store: Arc<TopologyStore>,
    pub consensus: Arc<Consensus>,
    pub liveness: Arc<LivenessTracker>,
    pub placement: Arc<ShardMap>,
}

impl Node {
    /// Starts consensus for the configured mode and seeds the topology.
    pub async fn start(cfg: &PeerageConfig) -> Result<Self, ClusterError> {
        let local_id = cfg.local_peer();
        let liveness = Arc::new(LivenessTracker::new());
        let placement = Arc::new(cfg.shard_map());

        let (store, consensus) = match cfg.cluster.mode {
            ClusterMode::Standalone => {
                let store = Arc::new(TopologyStore::empty());
                let local = LocalConsensus::new(Arc::clone(&store), local_id);
                admit_local(&local, local_id, cfg.advertised()).await?;
                (store, Arc::new(Consensus::Local(local)))
            }
            ClusterMode::Raft => {
                // seeded by the first applied raft entry or snapshot
                let store = Arc::new(TopologyStore::new());
                let raft_addr = cfg
                    .raft_addr()
                    .map_err(|e| ClusterError::Configuration(e.to_string()))?;
                let raft = RaftConsensus::start(
                    local_id,
                    raft_addr,
                    &cfg.raft_settings(),
                    Arc::clone(&store),
                    Arc::clone(&liveness),
                )
                .await?;

                let members = cfg.member_addrs();
                let bootstrapper = members.keys().next().copied();
                if bootstrapper == Some(local_id) {
                    raft.initialize(&members).await?;
                }

                let consensus = Arc::new(Consensus::Raft(raft));
                spawn_member_admission(
                    Arc::clone(&consensus),
                    Arc::clone(&store),
                    members.into_iter().collect(),
                );
                (store, consensus)
            }
        };

        spawn_liveness_pruning(&store, Arc::clone(&liveness));
        info!(peer_id = %local_id, mode = ?cfg.cluster.mode, "node started");
        Ok(Self {
            local_id,
            store,
            consensus,
            liveness,
            placement,
        })
    }

    /// Announces departure and stops consensus. Best effort.
    pub async fn shutdown(&self) {
        let leave = TopologyChange::MarkLeaving {
            peer_id: self.local_id,
        };
        match tokio::time::timeout(LEAVE_TIMEOUT, self.consensus.propose(leave)).await {
            Ok(Ok(entry)) => info!(version = entry.version, "marked self as leaving"),
            Ok(Err(e)) => warn!("could not mark self as leaving: {e}"),
            Err(_) => warn!("timed out marking self as leaving"),
        }

        if let Consensus::Raft(raft) = &*self.consensus {
            raft.shutdown().await;
        }
    }
}

/// Adds and activates the local peer in a standalone topology.
async fn admit_local(
    consensus: &LocalConsensus,
    local_id: PeerId,
    addr: String,
) -> Result<(), ClusterError> {
    let changes = [
        TopologyChange::AddPeer {
            peer_id: local_id,
            addr,
            joined_at_ms: peerage_cluster::unix_ms(),
        },
        TopologyChange::ActivatePeer { peer_id: local_id },
    ];
    for change in changes {
        consensus
            .propose(change)
            .await
            .map_err(|e| ClusterError::Configuration(format!("failed to seed topology: {e}")))?;
    }
    Ok(())
}

/// Spawns a task that admits configured raft members into the topology.
///
/// Whichever node leads proposes `AddPeer` then `ActivatePeer` for every
/// member that is missing or still joining. The task ends once every member
/// is active, leaving or retired.
fn spawn_member_admission(
    consensus: Arc<Consensus>,
    store: Arc<TopologyStore>,
    members: Vec<(PeerId, String)>,
) {
    tokio::spawn(async move {
        let Consensus::Raft(raft) = &*consensus else {
            return;
        };
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            let pending = match store.current_view() {
                Ok(view) => pending_admissions(&view, &members),
                Err(_) => members.iter().map(|(id, addr)| join(*id, addr)).collect(),
            };
            if pending.is_empty() {
                info!(members = members.len(), "all configured members admitted");
                return;
            }
            if !raft.is_leader() {
                continue;
            }

            for change in pending {
                match consensus.propose(change.clone()).await {
                    Ok(entry) => debug!(version = entry.version, "admission: {change}"),
                    Err(e) => {
                        debug!("admission of {change} not committed: {e}");
                        break;
                    }
                }
            }
        }
    });
}

/// The next admission step for each configured member.
fn pending_admissions(
    view: &peerage_cluster::ClusterTopology,
    members: &[(PeerId, String)],
) -> Vec<TopologyChange> {
    members
        .iter()
        .filter(|(id, _)| !view.is_retired(*id))
        .filter_map(|(id, addr)| match view.peer_state(*id) {
            None => Some(join(*id, addr)),
            Some(PeerState::Joining) => Some(TopologyChange::ActivatePeer { peer_id: *id }),
            Some(_) => None,
        })
        .collect()
}

fn join(peer_id: PeerId, addr: &str) -> TopologyChange {
    TopologyChange::AddPeer {
        peer_id,
        addr: addr.to_string(),
        joined_at_ms: peerage_cluster::unix_ms(),
    }
}
