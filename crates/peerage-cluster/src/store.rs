//! The topology store: authoritative, versioned membership view.
//!
//! Readers get an immutable `Arc<ClusterTopology>`; the single writer (the
//! consensus commit stream) publishes a whole new version through a watch
//! channel. Readers never block the writer and never see a half-applied
//! change.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::topology::{ClusterTopology, CommittedEntry};
use crate::ClusterError;

/// Published value: `None` until the store is seeded.
pub type TopologyView = Option<Arc<ClusterTopology>>;

#[derive(Debug)]
pub struct TopologyStore {
    tx: watch::Sender<TopologyView>,
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyStore {
    /// Creates an unseeded store. Reads fail with `StoreUninitialized` until
    /// [`initialize`](Self::initialize) is called.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Creates a store seeded with the empty topology at version 0.
    pub fn empty() -> Self {
        let store = Self::new();
        store.initialize(ClusterTopology::empty());
        store
    }

    /// Seeds the store, or replaces the view wholesale (snapshot install).
    pub fn initialize(&self, topology: ClusterTopology) {
        debug!(version = topology.version(), "topology store initialized");
        self.tx.send_replace(Some(Arc::new(topology)));
    }

    pub fn is_initialized(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Returns the latest committed version.
    pub fn current_view(&self) -> Result<Arc<ClusterTopology>, ClusterError> {
        self.tx
            .borrow()
            .as_ref()
            .map(Arc::clone)
            .ok_or(ClusterError::StoreUninitialized)
    }

    /// Applies a committed entry and returns the resulting view.
    ///
    /// Entries at or below the current version are ignored, which makes
    /// replaying the commit stream safe.
    pub fn apply(&self, entry: &CommittedEntry) -> Result<Arc<ClusterTopology>, ClusterError> {
        let mut outcome = Err(ClusterError::StoreUninitialized);

        // compare and publish under the channel's write lock
        self.tx.send_if_modified(|view| {
            let Some(current) = view.as_ref() else {
                return false;
            };
            if entry.version <= current.version() {
                debug!(
                    version = entry.version,
                    current = current.version(),
                    "ignoring already applied entry"
                );
                outcome = Ok(Arc::clone(current));
                return false;
            }

            let (next, result) = current.next(entry);
            match result {
                Ok(()) => info!(version = entry.version, "committed: {}", entry.change),
                Err(e) => warn!(
                    version = entry.version,
                    "committed change not applicable ({}): {e}", entry.change
                ),
            }

            let next = Arc::new(next);
            outcome = Ok(Arc::clone(&next));
            *view = Some(next);
            true
        });

        outcome
    }

    /// Returns a receiver that observes every published version.
    pub fn subscribe(&self) -> watch::Receiver<TopologyView> {
        self.tx.subscribe()
    }
}
