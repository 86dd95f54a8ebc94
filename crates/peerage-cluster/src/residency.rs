//! Shard residency: does a peer still host shard data?
//!
//! Shard placement belongs to an external collaborator reached through the
//! [`ShardPlacement`] trait. The checker accepts a bounded-staleness answer;
//! safety comes from re-checking before every fenced removal proposal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::topology::PeerId;
use crate::ClusterError;

/// Identifier of a data shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors reported by the shard-placement collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("shard placement unreachable: {0}")]
    Unreachable(String),
}

/// Read access to the cluster's shard placement.
pub trait ShardPlacement: Send + Sync + 'static {
    /// Shards currently assigned to `peer`, as primary or replica.
    fn shards_on(
        &self,
        peer: PeerId,
    ) -> impl Future<Output = Result<BTreeSet<ShardId>, PlacementError>> + Send;
}

/// Answer of a residency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// The peer hosts no shards.
    Clear,
    /// The peer hosts this many shards.
    Hosting(usize),
    /// Placement could not be determined. Never safe to remove.
    Unknown,
}

impl Residency {
    pub fn is_clear(&self) -> bool {
        matches!(self, Residency::Clear)
    }
}

/// Wraps a placement collaborator with a timeout and the unknown-is-unsafe
/// policy.
#[derive(Debug)]
pub struct ShardResidencyChecker<P> {
    placement: P,
    timeout: Duration,
}

impl<P: ShardPlacement> ShardResidencyChecker<P> {
    pub fn new(placement: P, timeout: Duration) -> Self {
        Self { placement, timeout }
    }

    pub fn placement(&self) -> &P {
        &self.placement
    }

    /// Checks whether `peer` hosts shards.
    ///
    /// Collaborator errors become [`Residency::Unknown`]. Only a timeout is
    /// reported as an error.
    pub async fn has_shards(&self, peer: PeerId) -> Result<Residency, ClusterError> {
        match tokio::time::timeout(self.timeout, self.placement.shards_on(peer)).await {
            Ok(Ok(shards)) if shards.is_empty() => Ok(Residency::Clear),
            Ok(Ok(shards)) => Ok(Residency::Hosting(shards.len())),
            Ok(Err(e)) => {
                warn!(%peer, "residency unknown: {e}");
                Ok(Residency::Unknown)
            }
            Err(_) => {
                warn!(%peer, timeout = ?self.timeout, "residency check timed out");
                Err(ClusterError::Timeout)
            }
        }
    }
}

/// In-process shard placement: each shard maps to the peers holding a
/// replica of it.
///
/// Used as the placement collaborator when placement is static
/// configuration, and as the reference implementation in tests.
#[derive(Debug, Default)]
pub struct ShardMap {
    shards: RwLock<BTreeMap<ShardId, BTreeSet<PeerId>>>,
}

impl ShardMap {
    /// Creates an empty map with no assignments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from `(shard, replicas)` pairs.
    pub fn from_assignments<I, R>(assignments: I) -> Self
    where
        I: IntoIterator<Item = (ShardId, R)>,
        R: IntoIterator<Item = PeerId>,
    {
        let shards = assignments
            .into_iter()
            .map(|(shard, peers)| (shard, peers.into_iter().collect()))
            .collect();
        Self {
            shards: RwLock::new(shards),
        }
    }

    /// Places a replica of `shard` on `peer`.
    pub fn assign(&self, shard: ShardId, peer: PeerId) {
        let mut shards = self.shards.write().unwrap_or_else(|e| e.into_inner());
        shards.entry(shard).or_default().insert(peer);
    }

    /// Drops the replica of `shard` held by `peer`.
    pub fn unassign(&self, shard: ShardId, peer: PeerId) {
        let mut shards = self.shards.write().unwrap_or_else(|e| e.into_inner());
        if let Some(peers) = shards.get_mut(&shard) {
            peers.remove(&peer);
            if peers.is_empty() {
                shards.remove(&shard);
            }
        }
    }

    /// Returns every shard with a replica on `peer`.
    pub fn shards_for_peer(&self, peer: PeerId) -> BTreeSet<ShardId> {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        shards
            .iter()
            .filter(|(_, peers)| peers.contains(&peer))
            .map(|(shard, _)| *shard)
            .collect()
    }

    /// Returns the peers holding `shard`.
    pub fn replicas(&self, shard: ShardId) -> BTreeSet<PeerId> {
        let shards = self.shards.read().unwrap_or_else(|e| e.into_inner());
        shards.get(&shard).cloned().unwrap_or_default()
    }

    /// Number of shards with at least one replica.
    pub fn shard_count(&self) -> usize {
        self.shards.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl ShardPlacement for ShardMap {
    async fn shards_on(&self, peer: PeerId) -> Result<BTreeSet<ShardId>, PlacementError> {
        Ok(self.shards_for_peer(peer))
    }
}

impl<T: ShardPlacement> ShardPlacement for std::sync::Arc<T> {
    fn shards_on(
        &self,
        peer: PeerId,
    ) -> impl Future<Output = Result<BTreeSet<ShardId>, PlacementError>> + Send {
        (**self).shards_on(peer)
    }
}
