//! The consensus contract the membership core depends on.
//!
//! An adapter serializes topology changes across the cluster: a proposal
//! either commits at a version strictly greater than its fencing token, or
//! fails. Every commit is applied to the [`TopologyStore`] in commit order
//! before `propose` returns.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::TopologyStore;
use crate::topology::{ChangeError, CommittedEntry, PeerId, TopologyChange};

/// Why a proposal did not commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ConsensusError {
    /// The fencing token is stale. Re-validate against the new version.
    #[error("stale proposal: expected version {expected}, current is {current}")]
    Conflict { expected: u64, current: u64 },

    /// The change is not applicable to the committed topology.
    #[error("change rejected: {0}")]
    Rejected(ChangeError),

    /// No quorum, no leader, or a fatal consensus error.
    #[error("consensus unavailable: {0}")]
    Unavailable(String),
}

impl From<ChangeError> for ConsensusError {
    fn from(e: ChangeError) -> Self {
        match e {
            ChangeError::StaleVersion { expected, current } => {
                ConsensusError::Conflict { expected, current }
            }
            other => ConsensusError::Rejected(other),
        }
    }
}

/// How the local node takes part in consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    Standalone,
    Raft,
}

/// Point-in-time description of the consensus layer, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsensusStatus {
    pub mode: ConsensusMode,
    /// Role of the local node, e.g. "leader" or "follower".
    pub role: String,
    pub leader: Option<PeerId>,
    pub term: u64,
    /// Index of the last applied log entry, if any.
    pub last_applied: Option<u64>,
}

/// A linearizable propose/commit primitive for topology changes.
pub trait ConsensusAdapter: Send + Sync + 'static {
    /// Proposes `change` and waits until it is committed and applied.
    fn propose(
        &self,
        change: TopologyChange,
    ) -> impl Future<Output = Result<CommittedEntry, ConsensusError>> + Send;

    /// Describes the local node's view of consensus.
    fn status(&self) -> ConsensusStatus;
}

/// Single-process consensus: commits are serialized by a mutex and applied
/// directly to the store.
///
/// Each commit lands at `current + 1`.
#[derive(Debug)]
pub struct LocalConsensus {
    store: Arc<TopologyStore>,
    local_id: PeerId,
    commit_lock: Mutex<()>,
}

impl LocalConsensus {
    pub fn new(store: Arc<TopologyStore>, local_id: PeerId) -> Self {
        Self {
            store,
            local_id,
            commit_lock: Mutex::new(()),
        }
    }
}

impl ConsensusAdapter for LocalConsensus {
    async fn propose(&self, change: TopologyChange) -> Result<CommittedEntry, ConsensusError> {
        let _guard = self.commit_lock.lock().await;

        let view = self
            .store
            .current_view()
            .map_err(|e| ConsensusError::Unavailable(e.to_string()))?;
        view.check(&change)?;

        let entry = CommittedEntry {
            version: view.version() + 1,
            change,
        };
        self.store
            .apply(&entry)
            .map_err(|e| ConsensusError::Unavailable(e.to_string()))?;

        debug!(version = entry.version, "local commit");
        Ok(entry)
    }

    fn status(&self) -> ConsensusStatus {
        ConsensusStatus {
            mode: ConsensusMode::Standalone,
            role: "leader".into(),
            leader: Some(self.local_id),
            term: 0,
            last_applied: self.store.current_view().ok().map(|v| v.version()),
        }
    }
}
