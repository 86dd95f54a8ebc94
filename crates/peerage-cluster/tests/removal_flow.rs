//! End-to-end scenarios for the peer removal workflow.
//!
//! The consensus and placement collaborators are scripted doubles built on
//! the public traits, so each scenario controls exactly which conflicts,
//! failures and stalls the coordinator sees.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peerage_cluster::{
    ClusterStatusSnapshot, CommittedEntry, ConsensusAdapter, ConsensusError, ConsensusStatus,
    FailReason, LivenessTracker, LocalConsensus, PeerId, PlacementError, RejectReason,
    RemovalConfig, RemovalCoordinator, RemovalOutcome, RemovalState, ShardId, ShardMap,
    ShardPlacement, StatusReporter, TopologyChange, TopologyStore,
};

// -- helpers --

/// A store holding peers `ids`, all active. Each peer costs two versions.
async fn cluster(ids: &[u64]) -> (Arc<TopologyStore>, Arc<LocalConsensus>) {
    let store = Arc::new(TopologyStore::empty());
    let consensus = Arc::new(LocalConsensus::new(Arc::clone(&store), PeerId(1)));
    for id in ids {
        consensus
            .propose(TopologyChange::AddPeer {
                peer_id: PeerId(*id),
                addr: format!("10.0.0.{id}:6335"),
                joined_at_ms: 0,
            })
            .await
            .unwrap();
        consensus
            .propose(TopologyChange::ActivatePeer {
                peer_id: PeerId(*id),
            })
            .await
            .unwrap();
    }
    (store, consensus)
}

enum Step {
    Conflict,
    Unavailable,
    Stall,
}

/// Plays back a fixed script of failures, then delegates to real local
/// consensus.
struct Scripted {
    inner: LocalConsensus,
    script: Mutex<VecDeque<Step>>,
    proposals: Mutex<Vec<TopologyChange>>,
}

impl Scripted {
    fn new(store: &Arc<TopologyStore>, script: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalConsensus::new(Arc::clone(store), PeerId(1)),
            script: Mutex::new(script.into_iter().collect()),
            proposals: Mutex::new(Vec::new()),
        })
    }

    fn proposals(&self) -> Vec<TopologyChange> {
        self.proposals.lock().unwrap().clone()
    }
}

impl ConsensusAdapter for Scripted {
    async fn propose(&self, change: TopologyChange) -> Result<CommittedEntry, ConsensusError> {
        self.proposals.lock().unwrap().push(change.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Conflict) => Err(ConsensusError::Conflict {
                expected: change.expected_version().unwrap_or_default(),
                current: change.expected_version().unwrap_or_default() + 1,
            }),
            Some(Step::Unavailable) => Err(ConsensusError::Unavailable("no quorum".into())),
            Some(Step::Stall) => std::future::pending().await,
            None => self.inner.propose(change).await,
        }
    }

    fn status(&self) -> ConsensusStatus {
        self.inner.status()
    }
}

struct Unreachable;

impl ShardPlacement for Unreachable {
    async fn shards_on(&self, _peer: PeerId) -> Result<BTreeSet<ShardId>, PlacementError> {
        Err(PlacementError::Unreachable("placement service down".into()))
    }
}

struct Stalled;

impl ShardPlacement for Stalled {
    async fn shards_on(&self, _peer: PeerId) -> Result<BTreeSet<ShardId>, PlacementError> {
        std::future::pending().await
    }
}

fn snapshot(store: &Arc<TopologyStore>) -> ClusterStatusSnapshot {
    let consensus = Arc::new(LocalConsensus::new(Arc::clone(store), PeerId(1)));
    StatusReporter::new(
        PeerId(1),
        Arc::clone(store),
        consensus,
        Arc::new(LivenessTracker::new()),
        Duration::from_secs(10),
    )
    .snapshot()
    .unwrap()
}

// -- removal outcomes --

#[tokio::test]
async fn empty_peer_is_removed_at_next_version() {
    let store = Arc::new(TopologyStore::empty());
    let consensus = Arc::new(LocalConsensus::new(Arc::clone(&store), PeerId(1)));
    for id in [1, 2, 3] {
        consensus
            .propose(TopologyChange::AddPeer {
                peer_id: PeerId(id),
                addr: format!("10.0.0.{id}:6335"),
                joined_at_ms: 0,
            })
            .await
            .unwrap();
    }
    consensus
        .propose(TopologyChange::ActivatePeer { peer_id: PeerId(1) })
        .await
        .unwrap();
    consensus
        .propose(TopologyChange::ActivatePeer { peer_id: PeerId(2) })
        .await
        .unwrap();
    assert_eq!(store.current_view().unwrap().version(), 5);

    let coordinator = RemovalCoordinator::new(
        Arc::clone(&store),
        consensus,
        ShardMap::new(),
        RemovalConfig::default(),
    );
    let report = coordinator.remove_peer(PeerId(3)).await;

    assert_eq!(report.outcome, RemovalOutcome::Succeeded { version: 6 });
    assert_eq!(report.outcome.http_status(), 200);
    let status = snapshot(&store);
    assert_eq!(status.version, 6);
    assert!(status.peer(PeerId(3)).is_none());
    assert_eq!(status.retired, vec![PeerId(3)]);
}

#[tokio::test]
async fn absent_peer_is_not_found() {
    let (store, consensus) = cluster(&[1, 2, 3]).await;
    let coordinator =
        RemovalCoordinator::new(store, consensus, ShardMap::new(), RemovalConfig::default());

    let report = coordinator.remove_peer(PeerId(7)).await;
    assert_eq!(report.outcome, RemovalOutcome::Rejected(RejectReason::NotFound));
    assert_eq!(report.proposals, 0);
}

#[tokio::test]
async fn peer_with_shards_is_kept() {
    let (store, consensus) = cluster(&[1, 2, 3]).await;
    let placement = ShardMap::from_assignments([(ShardId(0), [PeerId(3)])]);
    let coordinator =
        RemovalCoordinator::new(Arc::clone(&store), consensus, placement, RemovalConfig::default());

    let report = coordinator.remove_peer(PeerId(3)).await;

    assert_eq!(report.outcome, RemovalOutcome::Rejected(RejectReason::HasShards));
    assert_eq!(report.outcome.http_status(), 400);
    assert_eq!(report.proposals, 0);
    assert!(store.current_view().unwrap().contains(PeerId(3)));
}

#[tokio::test]
async fn removal_allowed_once_shards_move_away() {
    let (store, consensus) = cluster(&[1, 2, 3]).await;
    let placement = Arc::new(ShardMap::from_assignments([(ShardId(0), [PeerId(3)])]));
    let coordinator = RemovalCoordinator::new(
        Arc::clone(&store),
        consensus,
        Arc::clone(&placement),
        RemovalConfig::default(),
    );

    let first = coordinator.remove_peer(PeerId(3)).await;
    assert_eq!(first.outcome, RemovalOutcome::Rejected(RejectReason::HasShards));

    placement.assign(ShardId(0), PeerId(2));
    placement.unassign(ShardId(0), PeerId(3));

    let second = coordinator.remove_peer(PeerId(3)).await;
    assert!(second.outcome.is_success());
}

#[tokio::test]
async fn unreachable_placement_blocks_removal() {
    let (store, consensus) = cluster(&[1, 2, 3]).await;
    let coordinator =
        RemovalCoordinator::new(store, consensus, Unreachable, RemovalConfig::default());

    let report = coordinator.remove_peer(PeerId(3)).await;
    assert_eq!(report.outcome, RemovalOutcome::Rejected(RejectReason::HasShards));
}

#[tokio::test(start_paused = true)]
async fn stalled_placement_times_out() {
    let (store, consensus) = cluster(&[1, 2, 3]).await;
    let coordinator = RemovalCoordinator::new(store, consensus, Stalled, RemovalConfig::default());

    let report = coordinator.remove_peer(PeerId(3)).await;
    assert_eq!(report.outcome, RemovalOutcome::Failed(FailReason::Timeout));
    assert_eq!(report.outcome.http_status(), 504);
}

// -- consensus failures --

#[tokio::test]
async fn two_conflicts_then_success() {
    let (store, _) = cluster(&[1, 2, 3]).await;
    let consensus = Scripted::new(&store, [Step::Conflict, Step::Conflict]);
    let coordinator = RemovalCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&consensus),
        ShardMap::new(),
        RemovalConfig::default(),
    );

    let report = coordinator.remove_peer(PeerId(3)).await;

    assert!(report.outcome.is_success());
    assert_eq!(report.proposals, 3);
    assert_eq!(consensus.proposals().len(), 3);
    // every retry went back through validation
    let validations = report
        .path
        .iter()
        .filter(|s| **s == RemovalState::Validating)
        .count();
    assert_eq!(validations, 3);
}

#[tokio::test]
async fn third_conflict_gives_up() {
    let (store, _) = cluster(&[1, 2, 3]).await;
    let consensus = Scripted::new(&store, [Step::Conflict, Step::Conflict, Step::Conflict]);
    let coordinator = RemovalCoordinator::new(
        Arc::clone(&store),
        consensus,
        ShardMap::new(),
        RemovalConfig::default(),
    );

    let report = coordinator.remove_peer(PeerId(3)).await;

    assert_eq!(
        report.outcome,
        RemovalOutcome::Failed(FailReason::TooManyConflicts)
    );
    assert_eq!(report.outcome.http_status(), 503);
    assert_eq!(report.proposals, 3);
    assert!(store.current_view().unwrap().contains(PeerId(3)));
}

#[tokio::test]
async fn unavailable_consensus_is_not_retried() {
    let (store, _) = cluster(&[1, 2, 3]).await;
    let consensus = Scripted::new(&store, [Step::Unavailable]);
    let coordinator = RemovalCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&consensus),
        ShardMap::new(),
        RemovalConfig::default(),
    );

    let report = coordinator.remove_peer(PeerId(3)).await;

    assert_eq!(
        report.outcome,
        RemovalOutcome::Failed(FailReason::ConsensusUnavailable)
    );
    assert_eq!(consensus.proposals().len(), 1);
    assert_eq!(
        report.path.last(),
        Some(&RemovalState::Failed)
    );
}

#[tokio::test(start_paused = true)]
async fn stalled_proposal_times_out() {
    let (store, _) = cluster(&[1, 2, 3]).await;
    let consensus = Scripted::new(&store, [Step::Stall]);
    let coordinator = RemovalCoordinator::new(
        Arc::clone(&store),
        consensus,
        ShardMap::new(),
        RemovalConfig::default(),
    );

    let report = coordinator.remove_peer(PeerId(3)).await;
    assert_eq!(report.outcome, RemovalOutcome::Failed(FailReason::Timeout));
}

#[tokio::test]
async fn proposals_carry_the_validated_version() {
    let (store, _) = cluster(&[1, 2, 3]).await;
    let version = store.current_view().unwrap().version();
    let consensus = Scripted::new(&store, []);
    let coordinator = RemovalCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&consensus),
        ShardMap::new(),
        RemovalConfig::default(),
    );

    coordinator.remove_peer(PeerId(2)).await;

    assert_eq!(
        consensus.proposals(),
        vec![TopologyChange::remove(PeerId(2), version)]
    );
}

// -- concurrency --

#[tokio::test]
async fn concurrent_removals_of_the_same_peer() {
    let (store, consensus) = cluster(&[1, 2, 3]).await;
    let coordinator = Arc::new(RemovalCoordinator::new(
        Arc::clone(&store),
        consensus,
        ShardMap::new(),
        RemovalConfig::default(),
    ));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let c = Arc::clone(&coordinator);
            tokio::spawn(async move { c.remove_peer(PeerId(3)).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for h in handles {
        outcomes.push(h.await.unwrap().outcome);
    }

    assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 1);
    assert!(outcomes
        .iter()
        .filter(|o| !o.is_success())
        .all(|o| *o == RemovalOutcome::Rejected(RejectReason::NotFound)));
}

#[tokio::test]
async fn concurrent_removals_of_different_peers_all_land() {
    let (store, consensus) = cluster(&[1, 2, 3, 4, 5]).await;
    let coordinator = Arc::new(RemovalCoordinator::new(
        Arc::clone(&store),
        consensus,
        ShardMap::new(),
        RemovalConfig::default(),
    ));

    let a = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move { c.remove_peer(PeerId(4)).await })
    };
    let b = {
        let c = Arc::clone(&coordinator);
        tokio::spawn(async move { c.remove_peer(PeerId(5)).await })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    // a conflict on one side is retried within the bound
    assert!(a.outcome.is_success());
    assert!(b.outcome.is_success());
    let view = store.current_view().unwrap();
    assert!(!view.contains(PeerId(4)));
    assert!(!view.contains(PeerId(5)));
}

#[tokio::test]
async fn removed_peer_cannot_rejoin() {
    let (store, consensus) = cluster(&[1, 2, 3]).await;
    let coordinator = RemovalCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&consensus),
        ShardMap::new(),
        RemovalConfig::default(),
    );
    assert!(coordinator.remove_peer(PeerId(3)).await.outcome.is_success());

    let err = consensus
        .propose(TopologyChange::AddPeer {
            peer_id: PeerId(3),
            addr: "10.0.0.3:6335".into(),
            joined_at_ms: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ConsensusError::Rejected(_)));
    assert!(!store.current_view().unwrap().contains(PeerId(3)));
}

#[tokio::test]
async fn status_of_fresh_cluster_is_empty() {
    let store = Arc::new(TopologyStore::empty());
    let status = snapshot(&store);
    assert_eq!(status.version, 0);
    assert!(status.peers.is_empty());
}
