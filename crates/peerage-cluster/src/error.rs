//! Error types for cluster operations.

/// Errors that can occur while reading or updating cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// The topology store has not been seeded yet.
    #[error("topology store is not initialized")]
    StoreUninitialized,

    /// Timeout waiting for a cluster operation.
    #[error("cluster operation timed out")]
    Timeout,

    /// The raft engine failed to start or hit a fatal error.
    #[error("raft error: {0}")]
    Raft(String),

    /// Configuration error.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),
}
