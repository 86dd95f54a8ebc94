//! Safe peer removal.
//!
//! Each request walks a bounded state machine:
//!
//! ```text
//! Received -> Validating -> Proposing -> Committing -> Succeeded
//!                 ^                          |
//!                 +------- conflict ---------+        (Rejected | Failed)
//! ```
//!
//! A peer is only proposed for removal right after a residency check found
//! it empty, and the proposal is fenced on the topology version that check
//! ran against. When the fence is stale the whole validation is repeated:
//! a rebalance may have placed a shard on the peer in the meantime.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::consensus::{ConsensusAdapter, ConsensusError};
use crate::residency::{Residency, ShardPlacement, ShardResidencyChecker};
use crate::store::TopologyStore;
use crate::time::unix_ms;
use crate::topology::{ChangeError, PeerId, TopologyChange};
use crate::ClusterError;

/// Tuning for the removal workflow.
#[derive(Debug, Clone)]
pub struct RemovalConfig {
    /// Fencing conflicts tolerated before giving up.
    pub max_conflict_retries: u32,
    /// Bound on a single residency check.
    pub residency_timeout: Duration,
    /// Bound on a single consensus proposal.
    pub proposal_timeout: Duration,
}

impl Default for RemovalConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            residency_timeout: Duration::from_secs(5),
            proposal_timeout: Duration::from_secs(10),
        }
    }
}

/// An incoming removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemovalRequest {
    pub peer_id: PeerId,
    pub requested_at_ms: u64,
}

impl RemovalRequest {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            requested_at_ms: unix_ms(),
        }
    }
}

/// States a request moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalState {
    Received,
    Validating,
    Proposing,
    Committing,
    Succeeded,
    Rejected,
    Failed,
}

/// Permanent reasons a removal was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    /// The peer is not a member of the current topology.
    NotFound,
    /// The peer hosts shards, or residency could not be determined.
    HasShards,
}

/// Infrastructure failures surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailReason {
    /// Every allowed attempt hit a stale fencing token.
    TooManyConflicts,
    /// Consensus could not commit the proposal.
    ConsensusUnavailable,
    /// A residency check or proposal exceeded its timeout.
    Timeout,
    /// The topology store has not been seeded.
    StoreUninitialized,
}

/// Terminal outcome of a removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "lowercase")]
pub enum RemovalOutcome {
    /// The removal committed at `version`.
    Succeeded { version: u64 },
    Rejected(RejectReason),
    Failed(FailReason),
}

impl RemovalOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RemovalOutcome::Succeeded { .. })
    }

    /// HTTP status code the outcome maps to at the API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            RemovalOutcome::Succeeded { .. } => 200,
            RemovalOutcome::Rejected(RejectReason::NotFound) => 404,
            RemovalOutcome::Rejected(RejectReason::HasShards) => 400,
            RemovalOutcome::Failed(FailReason::Timeout) => 504,
            RemovalOutcome::Failed(_) => 503,
        }
    }

    /// Short stable label, used for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RemovalOutcome::Succeeded { .. } => "succeeded",
            RemovalOutcome::Rejected(RejectReason::NotFound) => "not_found",
            RemovalOutcome::Rejected(RejectReason::HasShards) => "has_shards",
            RemovalOutcome::Failed(FailReason::TooManyConflicts) => "too_many_conflicts",
            RemovalOutcome::Failed(FailReason::ConsensusUnavailable) => "consensus_unavailable",
            RemovalOutcome::Failed(FailReason::Timeout) => "timeout",
            RemovalOutcome::Failed(FailReason::StoreUninitialized) => "store_uninitialized",
        }
    }

    fn state(&self) -> RemovalState {
        match self {
            RemovalOutcome::Succeeded { .. } => RemovalState::Succeeded,
            RemovalOutcome::Rejected(_) => RemovalState::Rejected,
            RemovalOutcome::Failed(_) => RemovalState::Failed,
        }
    }
}

impl fmt::Display for RemovalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalOutcome::Succeeded { version } => write!(f, "removed at version {version}"),
            RemovalOutcome::Rejected(RejectReason::NotFound) => write!(f, "peer not found"),
            RemovalOutcome::Rejected(RejectReason::HasShards) => {
                write!(f, "peer still hosts shards or residency is unknown")
            }
            RemovalOutcome::Failed(FailReason::TooManyConflicts) => {
                write!(f, "gave up after repeated topology conflicts")
            }
            RemovalOutcome::Failed(FailReason::ConsensusUnavailable) => {
                write!(f, "consensus unavailable")
            }
            RemovalOutcome::Failed(FailReason::Timeout) => write!(f, "timed out"),
            RemovalOutcome::Failed(FailReason::StoreUninitialized) => {
                write!(f, "topology store is not initialized")
            }
        }
    }
}

/// What happened to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub request: RemovalRequest,
    pub outcome: RemovalOutcome,
    /// Proposals sent to consensus.
    pub proposals: u32,
    /// Every state visited, in order, ending with the terminal one.
    pub path: Vec<RemovalState>,
}

/// Orchestrates `remove_peer`.
///
/// Holds no per-request state; concurrent requests are serialized only by
/// the consensus adapter's fencing check.
#[derive(Debug)]
pub struct RemovalCoordinator<C, P> {
    store: Arc<TopologyStore>,
    consensus: Arc<C>,
    residency: ShardResidencyChecker<P>,
    config: RemovalConfig,
}

impl<C, P> RemovalCoordinator<C, P>
where
    C: ConsensusAdapter,
    P: ShardPlacement,
{
    pub fn new(
        store: Arc<TopologyStore>,
        consensus: Arc<C>,
        placement: P,
        config: RemovalConfig,
    ) -> Self {
        let residency = ShardResidencyChecker::new(placement, config.residency_timeout);
        Self {
            store,
            consensus,
            residency,
            config,
        }
    }

    pub fn config(&self) -> &RemovalConfig {
        &self.config
    }

    /// Runs the removal workflow for `peer_id` to a terminal outcome.
    pub async fn remove_peer(&self, peer_id: PeerId) -> RemovalReport {
        let mut run = Run::new(RemovalRequest::new(peer_id));
        let outcome = self.drive(&mut run).await;
        run.finish(outcome)
    }

    async fn drive(&self, run: &mut Run) -> RemovalOutcome {
        let peer_id = run.request.peer_id;
        let mut conflicts = 0u32;

        loop {
            run.enter(RemovalState::Validating);

            let view = match self.store.current_view() {
                Ok(view) => view,
                Err(_) => return RemovalOutcome::Failed(FailReason::StoreUninitialized),
            };
            if !view.contains(peer_id) {
                return RemovalOutcome::Rejected(RejectReason::NotFound);
            }

            match self.residency.has_shards(peer_id).await {
                Ok(Residency::Clear) => {}
                Ok(residency) => {
                    debug!(%peer_id, ?residency, "peer is not safe to remove");
                    return RemovalOutcome::Rejected(RejectReason::HasShards);
                }
                Err(_) => return RemovalOutcome::Failed(FailReason::Timeout),
            }

            run.enter(RemovalState::Proposing);
            let change = TopologyChange::remove(peer_id, view.version());
            run.proposals += 1;

            run.enter(RemovalState::Committing);
            let committed = tokio::time::timeout(
                self.config.proposal_timeout,
                self.consensus.propose(change),
            )
            .await;

            match committed {
                Ok(Ok(entry)) => {
                    // consensus already applied it; this is a no-op unless
                    // the adapter delivers commits lazily
                    return match self.store.apply(&entry) {
                        Ok(_) => RemovalOutcome::Succeeded {
                            version: entry.version,
                        },
                        Err(ClusterError::StoreUninitialized) => {
                            RemovalOutcome::Failed(FailReason::StoreUninitialized)
                        }
                        Err(e) => {
                            warn!(%peer_id, "failed to apply committed removal: {e}");
                            RemovalOutcome::Failed(FailReason::ConsensusUnavailable)
                        }
                    };
                }
                Ok(Err(ConsensusError::Conflict { expected, current })) => {
                    conflicts += 1;
                    debug!(%peer_id, expected, current, conflicts, "fencing conflict");
                    if conflicts >= self.config.max_conflict_retries {
                        return RemovalOutcome::Failed(FailReason::TooManyConflicts);
                    }
                }
                Ok(Err(ConsensusError::Rejected(
                    ChangeError::UnknownPeer(_) | ChangeError::PeerRetired(_),
                ))) => {
                    // a concurrent removal of the same peer won
                    return RemovalOutcome::Rejected(RejectReason::NotFound);
                }
                Ok(Err(e)) => {
                    warn!(%peer_id, "removal proposal failed: {e}");
                    return RemovalOutcome::Failed(FailReason::ConsensusUnavailable);
                }
                Err(_) => {
                    // the proposal may still commit; callers re-read status
                    warn!(%peer_id, timeout = ?self.config.proposal_timeout, "removal proposal timed out");
                    return RemovalOutcome::Failed(FailReason::Timeout);
                }
            }
        }
    }
}

/// Bookkeeping for one request.
struct Run {
    request: RemovalRequest,
    proposals: u32,
    path: Vec<RemovalState>,
}

impl Run {
    fn new(request: RemovalRequest) -> Self {
        Self {
            request,
            proposals: 0,
            path: vec![RemovalState::Received],
        }
    }

    fn enter(&mut self, state: RemovalState) {
        debug!(peer_id = %self.request.peer_id, ?state, "removal transition");
        self.path.push(state);
    }

    fn finish(mut self, outcome: RemovalOutcome) -> RemovalReport {
        self.path.push(outcome.state());
        info!(
            peer_id = %self.request.peer_id,
            proposals = self.proposals,
            outcome = outcome.label(),
            "remove_peer: {outcome}"
        );
        RemovalReport {
            request: self.request,
            outcome,
            proposals: self.proposals,
            path: self.path,
        }
    }
}
