//! Server configuration.
//!
//! `PeerageConfig` is resolved in order: defaults, then the TOML file given
//! with `--config`, then env vars and CLI flags (see `apply_args` in
//! `main.rs`). Every field has a default so a partial file is valid.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use peerage_cluster::{PeerId, RaftSettings, RemovalConfig, ShardId, ShardMap};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{}': {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How the node takes part in consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Single process; changes commit locally.
    Standalone,
    /// Replicated through raft with the configured members.
    Raft,
}

/// Parses a cluster mode name from a CLI string.
pub fn parse_cluster_mode(input: &str) -> Result<ClusterMode, String> {
    match input.to_ascii_lowercase().as_str() {
        "standalone" => Ok(ClusterMode::Standalone),
        "raft" => Ok(ClusterMode::Raft),
        _ => Err(format!(
            "unknown cluster mode '{input}'. valid options: standalone, raft"
        )),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerageConfig {
    /// Address the HTTP API binds to.
    pub bind: String,
    pub port: u16,
    pub peer_id: u64,
    /// Address other peers use to reach this one. Defaults to `bind:port`.
    pub advertise_addr: String,
    /// Serve prometheus metrics on `/metrics`.
    pub metrics: bool,
    pub cluster: ClusterConfig,
    pub removal: RemovalSection,
    /// Static shard placement.
    pub shards: Vec<ShardAssignment>,
}

impl Default for PeerageConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 6333,
            peer_id: 1,
            advertise_addr: String::new(),
            metrics: true,
            cluster: ClusterConfig::default(),
            removal: RemovalSection::default(),
            shards: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub mode: ClusterMode,
    /// Port of the raft RPC listener, on `bind`.
    pub raft_port: u16,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// A peer with no heartbeat for this long is reported stale.
    pub liveness_threshold_ms: u64,
    /// How often each raft member pings the others.
    pub liveness_probe_interval_ms: u64,
    /// Raft voters, including this node.
    pub members: Vec<MemberConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::Standalone,
            raft_port: 6335,
            heartbeat_interval_ms: 500,
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
            liveness_threshold_ms: 10_000,
            liveness_probe_interval_ms: 1000,
            members: Vec::new(),
        }
    }
}

/// A configured raft member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub id: u64,
    /// Raft address, `host:port`.
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemovalSection {
    pub max_conflict_retries: u32,
    pub residency_timeout_ms: u64,
    pub proposal_timeout_ms: u64,
}

impl Default for RemovalSection {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            residency_timeout_ms: 5_000,
            proposal_timeout_ms: 10_000,
        }
    }
}

/// One `[[shards]]` entry: a shard and the peers holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub id: u32,
    pub peers: Vec<u64>,
}

impl PeerageConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks cross-field constraints. Called once after all overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.removal.max_conflict_retries == 0 {
            return invalid("removal.max_conflict_retries must be at least 1".into());
        }
        if self.removal.residency_timeout_ms == 0 || self.removal.proposal_timeout_ms == 0 {
            return invalid("removal timeouts must be nonzero".into());
        }
        if self.cluster.liveness_threshold_ms == 0 {
            return invalid("cluster.liveness_threshold_ms must be nonzero".into());
        }

        let mut seen = BTreeSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.id) {
                return invalid(format!("shard {} is listed twice", shard.id));
            }
        }

        if self.cluster.mode == ClusterMode::Raft {
            let c = &self.cluster;
            if c.members.is_empty() {
                return invalid("raft mode requires at least one cluster member".into());
            }
            let mut ids = BTreeSet::new();
            for m in &c.members {
                if !ids.insert(m.id) {
                    return invalid(format!("member id {} is listed twice", m.id));
                }
                if m.addr.is_empty() {
                    return invalid(format!("member {} has no address", m.id));
                }
            }
            if !ids.contains(&self.peer_id) {
                return invalid(format!(
                    "peer id {} is not among the configured members",
                    self.peer_id
                ));
            }
            if c.heartbeat_interval_ms == 0 || c.heartbeat_interval_ms >= c.election_timeout_min_ms
            {
                return invalid(
                    "heartbeat_interval_ms must be nonzero and below election_timeout_min_ms"
                        .into(),
                );
            }
            if c.election_timeout_min_ms >= c.election_timeout_max_ms {
                return invalid(
                    "election_timeout_min_ms must be below election_timeout_max_ms".into(),
                );
            }
            if c.liveness_probe_interval_ms == 0
                || c.liveness_probe_interval_ms >= c.liveness_threshold_ms
            {
                return invalid(
                    "liveness_probe_interval_ms must be nonzero and below liveness_threshold_ms"
                        .into(),
                );
            }
        }
        Ok(())
    }

    pub fn local_peer(&self) -> PeerId {
        PeerId(self.peer_id)
    }

    /// Address recorded for this peer in the topology.
    pub fn advertised(&self) -> String {
        if !self.advertise_addr.is_empty() {
            return self.advertise_addr.clone();
        }
        match self.cluster.mode {
            ClusterMode::Standalone => format!("{}:{}", self.bind, self.port),
            ClusterMode::Raft => self
                .member_addrs()
                .remove(&self.local_peer())
                .unwrap_or_else(|| format!("{}:{}", self.bind, self.cluster.raft_port)),
        }
    }

    pub fn api_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.bind, self.port)
    }

    pub fn raft_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.bind, self.cluster.raft_port)
    }

    pub fn member_addrs(&self) -> BTreeMap<PeerId, String> {
        self.cluster
            .members
            .iter()
            .map(|m| (PeerId(m.id), m.addr.clone()))
            .collect()
    }

    pub fn raft_settings(&self) -> RaftSettings {
        RaftSettings {
            heartbeat_interval_ms: self.cluster.heartbeat_interval_ms,
            election_timeout_min_ms: self.cluster.election_timeout_min_ms,
            election_timeout_max_ms: self.cluster.election_timeout_max_ms,
            liveness_probe_interval_ms: self.cluster.liveness_probe_interval_ms,
            ..RaftSettings::default()
        }
    }

    pub fn removal_config(&self) -> RemovalConfig {
        RemovalConfig {
            max_conflict_retries: self.removal.max_conflict_retries,
            residency_timeout: Duration::from_millis(self.removal.residency_timeout_ms),
            proposal_timeout: Duration::from_millis(self.removal.proposal_timeout_ms),
        }
    }

    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_millis(self.cluster.liveness_threshold_ms)
    }

    pub fn shard_map(&self) -> ShardMap {
        ShardMap::from_assignments(
            self.shards
                .iter()
                .map(|s| (ShardId(s.id), s.peers.iter().copied().map(PeerId))),
        )
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("invalid bind address '{host}:{port}': {e}")))
}
