//! Operation counters and their serializable snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::StoreInner;
use crate::queue::QueueSnapshot;

#[derive(Default)]
pub(crate) struct Counters {
    pub loads: AtomicU64,
    pub stores: AtomicU64,
    pub get_nodes: AtomicU64,
    pub got_nodes: AtomicU64,
    pub get_links: AtomicU64,
    pub got_links: AtomicU64,
    pub inset_fetches: AtomicU64,
    pub inset_atoms: AtomicU64,
    pub node_inserts: AtomicU64,
    pub node_updates: AtomicU64,
    pub link_inserts: AtomicU64,
    pub link_updates: AtomicU64,
}

/// Point-in-time operation statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub loads: u64,
    pub stores: u64,
    /// Node lookups issued / lookups that found a row.
    pub get_nodes: u64,
    pub got_nodes: u64,
    pub get_links: u64,
    pub got_links: u64,
    /// Incoming-set queries issued / atoms they returned.
    pub incoming_fetches: u64,
    pub incoming_atoms: u64,
    pub node_inserts: u64,
    pub node_updates: u64,
    pub link_inserts: u64,
    pub link_updates: u64,
    pub queue: QueueSnapshot,
    /// Live handle↔id bindings.
    pub idmap_entries: usize,
    pub pool_idle: usize,
    pub pool_capacity: usize,
}

impl Counters {
    pub(crate) fn snapshot(&self, inner: &StoreInner, queue: QueueSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            get_nodes: self.get_nodes.load(Ordering::Relaxed),
            got_nodes: self.got_nodes.load(Ordering::Relaxed),
            get_links: self.get_links.load(Ordering::Relaxed),
            got_links: self.got_links.load(Ordering::Relaxed),
            incoming_fetches: self.inset_fetches.load(Ordering::Relaxed),
            incoming_atoms: self.inset_atoms.load(Ordering::Relaxed),
            node_inserts: self.node_inserts.load(Ordering::Relaxed),
            node_updates: self.node_updates.load(Ordering::Relaxed),
            link_inserts: self.link_inserts.load(Ordering::Relaxed),
            link_updates: self.link_updates.load(Ordering::Relaxed),
            queue,
            idmap_entries: inner.idmap.len(),
            pool_idle: inner.pool.idle_count(),
            pool_capacity: inner.pool.capacity(),
        }
    }
}

impl StatsSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
