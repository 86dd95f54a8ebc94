//! Cluster topology model.
//!
//! Defines peers, their lifecycle, the changes that consensus commits, and
//! the immutable versioned view those changes produce.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable integer identifier of a peer.
///
/// The same value is used as the raft node id, so a peer is addressed
/// identically by the topology and by the consensus layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(PeerId)
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        PeerId(id)
    }
}

/// Lifecycle of a peer within the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Admitted to the topology but not yet serving.
    Joining,
    /// Full member.
    Active,
    /// Announced its departure; still a member until removed.
    Leaving,
    /// Removed from the topology. Retired ids never come back.
    Removed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Joining => write!(f, "joining"),
            PeerState::Active => write!(f, "active"),
            PeerState::Leaving => write!(f, "leaving"),
            PeerState::Removed => write!(f, "removed"),
        }
    }
}

/// A member of the cluster as recorded by committed entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    /// Network address the peer advertises for cluster traffic.
    pub addr: String,
    pub state: PeerState,
    /// Last heartbeat recorded in the topology, in unix milliseconds.
    pub last_heartbeat_ms: u64,
}

impl Peer {
    /// Creates a peer in the `Joining` state.
    pub fn joining(id: PeerId, addr: impl Into<String>, at_ms: u64) -> Self {
        Self {
            id,
            addr: addr.into(),
            state: PeerState::Joining,
            last_heartbeat_ms: at_ms,
        }
    }
}

/// A topology delta, replicated through consensus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyChange {
    /// Admit a new peer in the `Joining` state.
    AddPeer {
        peer_id: PeerId,
        addr: String,
        joined_at_ms: u64,
    },
    /// Promote a joining peer to `Active`.
    ActivatePeer { peer_id: PeerId },
    /// Record that a peer intends to leave.
    MarkLeaving { peer_id: PeerId },
    /// Remove a peer, fenced on the topology version it was validated against.
    RemovePeer {
        peer_id: PeerId,
        expected_version: u64,
    },
}

impl TopologyChange {
    /// Builds a fenced removal.
    pub fn remove(peer_id: PeerId, expected_version: u64) -> Self {
        TopologyChange::RemovePeer {
            peer_id,
            expected_version,
        }
    }

    /// The peer this change is about.
    pub fn peer_id(&self) -> PeerId {
        match self {
            TopologyChange::AddPeer { peer_id, .. }
            | TopologyChange::ActivatePeer { peer_id }
            | TopologyChange::MarkLeaving { peer_id }
            | TopologyChange::RemovePeer { peer_id, .. } => *peer_id,
        }
    }

    /// The fencing token carried by the change, if any.
    pub fn expected_version(&self) -> Option<u64> {
        match self {
            TopologyChange::RemovePeer {
                expected_version, ..
            } => Some(*expected_version),
            _ => None,
        }
    }
}

impl fmt::Display for TopologyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyChange::AddPeer { peer_id, addr, .. } => write!(f, "add peer {peer_id} ({addr})"),
            TopologyChange::ActivatePeer { peer_id } => write!(f, "activate peer {peer_id}"),
            TopologyChange::MarkLeaving { peer_id } => write!(f, "mark peer {peer_id} leaving"),
            TopologyChange::RemovePeer {
                peer_id,
                expected_version,
            } => write!(f, "remove peer {peer_id} at version {expected_version}"),
        }
    }
}

/// A change together with the version consensus committed it at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEntry {
    pub version: u64,
    pub change: TopologyChange,
}

/// Reasons a change cannot be applied to a topology view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ChangeError {
    /// The fencing token no longer matches the current version.
    #[error("stale fencing token: expected version {expected}, current is {current}")]
    StaleVersion { expected: u64, current: u64 },

    #[error("peer {0} not found in topology")]
    UnknownPeer(PeerId),

    #[error("peer {0} is already a member")]
    DuplicatePeer(PeerId),

    #[error("peer {0} was removed and cannot rejoin")]
    PeerRetired(PeerId),

    #[error("peer {peer} cannot move from {from} to {to}")]
    InvalidTransition {
        peer: PeerId,
        from: PeerState,
        to: PeerState,
    },
}

/// One committed configuration version.
///
/// Immutable once published; the store replaces the whole value on every
/// commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    version: u64,
    peers: BTreeMap<PeerId, Peer>,
    /// Removed peer ids, with the version that removed them.
    retired: BTreeMap<PeerId, u64>,
}

impl ClusterTopology {
    /// Version 0 with no peers.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Current members, ordered by id.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Ids removed in this or an earlier version.
    pub fn retired(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.retired.keys().copied()
    }

    pub fn is_retired(&self, id: PeerId) -> bool {
        self.retired.contains_key(&id)
    }

    /// Lifecycle state of `id`, including `Removed` for retired ids.
    pub fn peer_state(&self, id: PeerId) -> Option<PeerState> {
        match self.peers.get(&id) {
            Some(peer) => Some(peer.state),
            None if self.is_retired(id) => Some(PeerState::Removed),
            None => None,
        }
    }

    /// Checks the fencing token and membership rules for a proposal.
    ///
    /// This is the check consensus performs before committing.
    pub fn check(&self, change: &TopologyChange) -> Result<(), ChangeError> {
        if let Some(expected) = change.expected_version() {
            if expected != self.version {
                return Err(ChangeError::StaleVersion {
                    expected,
                    current: self.version,
                });
            }
        }
        self.validate(change)
    }

    /// Checks membership rules only, ignoring the fencing token.
    ///
    /// Used when applying an entry that consensus already committed.
    pub fn validate(&self, change: &TopologyChange) -> Result<(), ChangeError> {
        let id = change.peer_id();
        if self.is_retired(id) {
            return Err(ChangeError::PeerRetired(id));
        }

        match change {
            TopologyChange::AddPeer { .. } => {
                if self.contains(id) {
                    return Err(ChangeError::DuplicatePeer(id));
                }
                Ok(())
            }
            TopologyChange::ActivatePeer { .. } => {
                self.check_transition(id, &[PeerState::Joining], PeerState::Active)
            }
            TopologyChange::MarkLeaving { .. } => self.check_transition(
                id,
                &[PeerState::Joining, PeerState::Active],
                PeerState::Leaving,
            ),
            TopologyChange::RemovePeer { .. } => {
                if !self.contains(id) {
                    return Err(ChangeError::UnknownPeer(id));
                }
                Ok(())
            }
        }
    }

    fn check_transition(
        &self,
        id: PeerId,
        allowed_from: &[PeerState],
        to: PeerState,
    ) -> Result<(), ChangeError> {
        let peer = self.peers.get(&id).ok_or(ChangeError::UnknownPeer(id))?;
        if allowed_from.contains(&peer.state) {
            Ok(())
        } else {
            Err(ChangeError::InvalidTransition {
                peer: id,
                from: peer.state,
                to,
            })
        }
    }

    /// Produces the view that follows `entry`.
    ///
    /// The returned view always carries `entry.version`. When the change
    /// fails validation the peer set is carried over unchanged and the
    /// validation error is returned alongside, so every replica still
    /// advances through the same version sequence.
    pub fn next(&self, entry: &CommittedEntry) -> (ClusterTopology, Result<(), ChangeError>) {
        let mut next = self.clone();
        next.version = entry.version;

        if let Err(e) = self.validate(&entry.change) {
            return (next, Err(e));
        }

        match &entry.change {
            TopologyChange::AddPeer {
                peer_id,
                addr,
                joined_at_ms,
            } => {
                next.peers
                    .insert(*peer_id, Peer::joining(*peer_id, addr.clone(), *joined_at_ms));
            }
            TopologyChange::ActivatePeer { peer_id } => {
                if let Some(peer) = next.peers.get_mut(peer_id) {
                    peer.state = PeerState::Active;
                }
            }
            TopologyChange::MarkLeaving { peer_id } => {
                if let Some(peer) = next.peers.get_mut(peer_id) {
                    peer.state = PeerState::Leaving;
                }
            }
            TopologyChange::RemovePeer { peer_id, .. } => {
                next.peers.remove(peer_id);
                next.retired.insert(*peer_id, entry.version);
            }
        }

        (next, Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(id: u64, version: u64) -> CommittedEntry {
        CommittedEntry {
            version,
            change: TopologyChange::AddPeer {
                peer_id: PeerId(id),
                addr: format!("10.0.0.{id}:6335"),
                joined_at_ms: 1_000,
            },
        }
    }

    fn build(ids: &[u64]) -> ClusterTopology {
        let mut topo = ClusterTopology::empty();
        for (i, id) in ids.iter().enumerate() {
            let (next, result) = topo.next(&add(*id, i as u64 + 1));
            result.unwrap();
            topo = next;
        }
        topo
    }

    #[test]
    fn peer_id_parse_and_display() {
        let id: PeerId = "42".parse().unwrap();
        assert_eq!(id, PeerId(42));
        assert_eq!(id.to_string(), "42");
        assert!("forty-two".parse::<PeerId>().is_err());
    }

    #[test]
    fn empty_topology() {
        let topo = ClusterTopology::empty();
        assert_eq!(topo.version(), 0);
        assert!(topo.is_empty());
        assert_eq!(topo.peer_state(PeerId(1)), None);
    }

    #[test]
    fn add_then_activate() {
        let topo = build(&[1]);
        assert_eq!(topo.peer_state(PeerId(1)), Some(PeerState::Joining));

        let (topo, result) = topo.next(&CommittedEntry {
            version: 2,
            change: TopologyChange::ActivatePeer { peer_id: PeerId(1) },
        });
        result.unwrap();
        assert_eq!(topo.version(), 2);
        assert_eq!(topo.peer_state(PeerId(1)), Some(PeerState::Active));
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let topo = build(&[1]);
        assert_eq!(
            topo.validate(&add(1, 2).change),
            Err(ChangeError::DuplicatePeer(PeerId(1)))
        );
    }

    #[test]
    fn remove_retires_peer() {
        let topo = build(&[1, 2, 3]);
        let (topo, result) = topo.next(&CommittedEntry {
            version: 4,
            change: TopologyChange::remove(PeerId(3), 3),
        });
        result.unwrap();

        assert_eq!(topo.version(), 4);
        assert!(!topo.contains(PeerId(3)));
        assert!(topo.is_retired(PeerId(3)));
        assert_eq!(topo.peer_state(PeerId(3)), Some(PeerState::Removed));
        assert_eq!(topo.len(), 2);
    }

    #[test]
    fn retired_peer_cannot_rejoin() {
        let topo = build(&[1, 2]);
        let (topo, _) = topo.next(&CommittedEntry {
            version: 3,
            change: TopologyChange::remove(PeerId(2), 2),
        });

        let (after, result) = topo.next(&add(2, 4));
        assert_eq!(result, Err(ChangeError::PeerRetired(PeerId(2))));
        // version still advances, membership does not
        assert_eq!(after.version(), 4);
        assert!(!after.contains(PeerId(2)));
    }

    #[test]
    fn check_enforces_fencing_token() {
        let topo = build(&[1, 2]);
        assert_eq!(
            topo.check(&TopologyChange::remove(PeerId(1), 1)),
            Err(ChangeError::StaleVersion {
                expected: 1,
                current: 2
            })
        );
        assert!(topo.check(&TopologyChange::remove(PeerId(1), 2)).is_ok());
        // validate ignores the token
        assert!(topo.validate(&TopologyChange::remove(PeerId(1), 1)).is_ok());
    }

    #[test]
    fn remove_unknown_peer() {
        let topo = build(&[1]);
        assert_eq!(
            topo.check(&TopologyChange::remove(PeerId(7), 1)),
            Err(ChangeError::UnknownPeer(PeerId(7)))
        );
    }

    #[test]
    fn leaving_peer_cannot_be_activated() {
        let topo = build(&[1]);
        let (topo, _) = topo.next(&CommittedEntry {
            version: 2,
            change: TopologyChange::MarkLeaving { peer_id: PeerId(1) },
        });
        assert_eq!(topo.peer_state(PeerId(1)), Some(PeerState::Leaving));
        assert_eq!(
            topo.validate(&TopologyChange::ActivatePeer { peer_id: PeerId(1) }),
            Err(ChangeError::InvalidTransition {
                peer: PeerId(1),
                from: PeerState::Leaving,
                to: PeerState::Active,
            })
        );
    }

    #[test]
    fn topology_json_roundtrip_keeps_retired() {
        let topo = build(&[1, 2]);
        let (topo, _) = topo.next(&CommittedEntry {
            version: 3,
            change: TopologyChange::remove(PeerId(1), 2),
        });
        let json = serde_json::to_vec(&topo).unwrap();
        let back: ClusterTopology = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, topo);
    }
}
