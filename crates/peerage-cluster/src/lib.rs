//! peerage-cluster: cluster membership and safe peer removal.
//!
//! # Architecture
//!
//! - **Topology**: a versioned, copy-on-write view of the peer set,
//!   published by [`TopologyStore`] and mutated only by committed entries
//! - **Consensus**: the [`ConsensusAdapter`] propose/commit contract, with a
//!   single-process [`LocalConsensus`] and a replicated [`RaftConsensus`]
//! - **Residency**: [`ShardResidencyChecker`] asks the shard-placement
//!   collaborator whether a peer still hosts data
//! - **Removal**: [`RemovalCoordinator`] runs the fenced
//!   validate/propose/commit workflow
//! - **Status**: [`StatusReporter`] joins the topology with peer liveness
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use peerage_cluster::*;
//!
//! let store = Arc::new(TopologyStore::empty());
//! let consensus = Arc::new(LocalConsensus::new(Arc::clone(&store), PeerId(1)));
//! let coordinator = RemovalCoordinator::new(
//!     store,
//!     consensus,
//!     ShardMap::new(),
//!     RemovalConfig::default(),
//! );
//!
//! let report = coordinator.remove_peer(PeerId(3)).await;
//! println!("{}", report.outcome);
//! ```

mod consensus;
mod error;
mod raft;
mod raft_transport;
mod removal;
mod residency;
mod status;
mod store;
mod time;
mod topology;

pub use consensus::{
    ConsensusAdapter, ConsensusError, ConsensusMode, ConsensusStatus, LocalConsensus,
};
pub use error::ClusterError;
pub use raft::{
    RaftConsensus, RaftSettings, Storage as RaftStorage, TopologyResponse, TopologySnapshot,
    TypeConfig,
};
pub use removal::{
    FailReason, RejectReason, RemovalConfig, RemovalCoordinator, RemovalOutcome, RemovalReport,
    RemovalRequest, RemovalState,
};
pub use residency::{
    PlacementError, Residency, ShardId, ShardMap, ShardPlacement, ShardResidencyChecker,
};
pub use status::{
    spawn_liveness_pruning, ClusterStatusSnapshot, Liveness, LivenessTracker, PeerStatus,
    StatusReporter,
};
pub use store::{TopologyStore, TopologyView};
pub use time::{age, unix_ms};
pub use topology::{
    ChangeError, ClusterTopology, CommittedEntry, Peer, PeerId, PeerState, TopologyChange,
};
