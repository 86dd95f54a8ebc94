//! Cluster status: the current topology joined with per-peer liveness.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::consensus::{ConsensusAdapter, ConsensusStatus};
use crate::store::TopologyStore;
use crate::time::{age, unix_ms};
use crate::topology::{PeerId, PeerState};
use crate::ClusterError;

/// Heartbeats observed locally, outside of consensus.
///
/// Committed heartbeat timestamps only move when a topology change touches
/// the peer, so the transport records every successful exchange here.
#[derive(Debug, Default)]
pub struct LivenessTracker {
    seen: RwLock<HashMap<PeerId, u64>>,
}

impl LivenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a heartbeat from `peer` at the current time.
    pub fn observe(&self, peer: PeerId) {
        self.observe_at(peer, unix_ms());
    }

    /// Records a heartbeat at `at_ms`. Older observations are ignored.
    pub fn observe_at(&self, peer: PeerId, at_ms: u64) {
        let mut seen = self.seen.write().unwrap_or_else(|e| e.into_inner());
        let last = seen.entry(peer).or_insert(at_ms);
        if at_ms > *last {
            *last = at_ms;
        }
    }

    pub fn last_seen(&self, peer: PeerId) -> Option<u64> {
        self.seen
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer)
            .copied()
    }

    /// Drops state for a peer that left the topology.
    pub fn forget(&self, peer: PeerId) {
        self.seen
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer);
    }
}

/// Spawns a task that forgets retired peers as their removals commit.
///
/// Ends when the store is dropped.
pub fn spawn_liveness_pruning(store: &TopologyStore, liveness: Arc<LivenessTracker>) {
    let mut rx = store.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let view = rx.borrow_and_update().clone();
            if let Some(view) = view {
                for peer in view.retired() {
                    liveness.forget(peer);
                }
            }
        }
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Alive,
    Stale,
}

/// One row of the status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub peer_id: PeerId,
    pub addr: String,
    pub state: PeerState,
    pub liveness: Liveness,
    /// Most recent heartbeat known for the peer, unix milliseconds.
    pub last_heartbeat_ms: u64,
}

/// Read model answering `cluster_status`. Recomputed per query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatusSnapshot {
    pub peer_id: PeerId,
    pub version: u64,
    pub peers: Vec<PeerStatus>,
    pub retired: Vec<PeerId>,
    pub consensus: ConsensusStatus,
}

impl ClusterStatusSnapshot {
    pub fn peer(&self, id: PeerId) -> Option<&PeerStatus> {
        self.peers.iter().find(|p| p.peer_id == id)
    }
}

/// Builds [`ClusterStatusSnapshot`]s. Never mutates anything it reads.
#[derive(Debug)]
pub struct StatusReporter<C> {
    local_id: PeerId,
    store: Arc<TopologyStore>,
    consensus: Arc<C>,
    liveness: Arc<LivenessTracker>,
    stale_after: Duration,
}

impl<C: ConsensusAdapter> StatusReporter<C> {
    pub fn new(
        local_id: PeerId,
        store: Arc<TopologyStore>,
        consensus: Arc<C>,
        liveness: Arc<LivenessTracker>,
        stale_after: Duration,
    ) -> Self {
        Self {
            local_id,
            store,
            consensus,
            liveness,
            stale_after,
        }
    }

    pub fn snapshot(&self) -> Result<ClusterStatusSnapshot, ClusterError> {
        self.snapshot_at(unix_ms())
    }

    /// Builds a snapshot as seen at `now_ms`.
    pub fn snapshot_at(&self, now_ms: u64) -> Result<ClusterStatusSnapshot, ClusterError> {
        let view = self.store.current_view()?;

        let peers = view
            .peers()
            .map(|peer| {
                let observed = if peer.id == self.local_id {
                    Some(now_ms)
                } else {
                    self.liveness.last_seen(peer.id)
                };
                let last_heartbeat_ms = observed.map_or(peer.last_heartbeat_ms, |seen| {
                    seen.max(peer.last_heartbeat_ms)
                });
                let liveness = if age(last_heartbeat_ms, now_ms) <= self.stale_after {
                    Liveness::Alive
                } else {
                    Liveness::Stale
                };
                PeerStatus {
                    peer_id: peer.id,
                    addr: peer.addr.clone(),
                    state: peer.state,
                    liveness,
                    last_heartbeat_ms,
                }
            })
            .collect();

        Ok(ClusterStatusSnapshot {
            peer_id: self.local_id,
            version: view.version(),
            peers,
            retired: view.retired().collect(),
            consensus: self.consensus.status(),
        })
    }
}
