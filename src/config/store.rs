//! Atomic configuration snapshot store.
//!
//! # Responsibilities
//! - Hold the active snapshot in one atomically-replaceable slot
//! - Give readers a lock-free handle that stays valid for their lifetime
//! - Invalidate dependent caches when a new snapshot is published
//!
//! # Design Decisions
//! - Readers clone an `Arc`; an in-flight request keeps the snapshot it
//!   observed at dispatch even across a publish
//! - Route tables are never mutated in place

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::loader::Snapshot;
use crate::transport::TransportCache;

pub struct ConfigStore {
    current: ArcSwap<Snapshot>,
    transports: Arc<TransportCache>,
}

impl ConfigStore {
    pub fn new(initial: Snapshot, transports: Arc<TransportCache>) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            transports,
        }
    }

    /// The active snapshot. Lock-free; the returned handle is immutable.
    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Atomically swap in a new snapshot and drop cached transports so
    /// they rebuild against the new defaults.
    pub fn publish(&self, snapshot: Snapshot) {
        let routes = snapshot.routes.len();
        self.current.store(Arc::new(snapshot));
        self.transports.clear();
        tracing::info!(routes, "Configuration published");
    }

    pub fn transports(&self) -> &Arc<TransportCache> {
        &self.transports
    }
}
