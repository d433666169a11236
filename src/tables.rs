//! Bounded, insertion-ordered recency tables.
//!
//! Three windows of recent history drive the engine: the ids of frames
//! already seen (flood dedup), the learned next-hop per destination, and the
//! delivery confirmations waiting to be matched. All three are FIFO windows:
//! when a table is full the oldest entry falls out, so memory stays bounded
//! and stale state ages away on its own.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::frame::MacAddr;

/// Window of recently observed message ids.
///
/// Written from both the link receive path and the worker, so it lives
/// behind [`SharedSeenIds`]. The lock is a regular mutex: on the supported
/// platforms the receive callback runs in task context, not an interrupt.
#[derive(Debug)]
pub(crate) struct SeenIds {
    ids: VecDeque<u32>,
    capacity: usize,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        SeenIds {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    /// Records `id`, evicting the oldest entry when the window is full.
    pub fn insert(&mut self, id: u32) {
        if self.ids.len() >= self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(id);
    }

    /// Single check-and-record step used by the receive path: returns false
    /// and records nothing if `id` is already present.
    pub fn insert_if_new(&mut self, id: u32) -> bool {
        if self.contains(id) {
            return false;
        }
        self.insert(id);
        true
    }
}

/// Handle to the seen-id window shared between the receive path and the worker.
pub(crate) type SharedSeenIds = Arc<Mutex<SeenIds>>;

pub(crate) fn shared_seen_ids(capacity: usize) -> SharedSeenIds {
    Arc::new(Mutex::new(SeenIds::new(capacity)))
}

/// Locks the shared window, recovering a poisoned guard rather than
/// unwinding into the worker.
pub(crate) fn lock_seen(seen: &SharedSeenIds) -> MutexGuard<'_, SeenIds> {
    seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
struct Route {
    destination: MacAddr,
    next_hop: MacAddr,
}

/// Learned next-hop per destination, at most one entry per destination.
///
/// Touched only from the worker, so it needs no lock.
#[derive(Debug)]
pub(crate) struct RouteTable {
    entries: VecDeque<Route>,
    capacity: usize,
}

impl RouteTable {
    pub fn new(capacity: usize) -> Self {
        RouteTable {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn next_hop(&self, destination: MacAddr) -> Option<MacAddr> {
        self.entries
            .iter()
            .find(|route| route.destination == destination)
            .map(|route| route.next_hop)
    }

    /// Learns `destination → next_hop`. Any previous entry for the
    /// destination is replaced; the oldest entry is evicted at capacity.
    pub fn learn(&mut self, destination: MacAddr, next_hop: MacAddr) {
        self.entries.retain(|route| route.destination != destination);
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Route {
            destination,
            next_hop,
        });
    }

    /// Forgets the route to `destination`, if any. Called when the link
    /// reports a failed transmission towards its next hop.
    pub fn invalidate(&mut self, destination: MacAddr) {
        self.entries.retain(|route| route.destination != destination);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Delivery confirmations that have arrived and wait for their unicast's
/// response-wait to collect them. Worker-only, no lock.
#[derive(Debug)]
pub(crate) struct ConfirmedIds {
    ids: VecDeque<u32>,
    capacity: usize,
}

impl ConfirmedIds {
    pub fn new(capacity: usize) -> Self {
        ConfirmedIds {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, id: u32) {
        if self.ids.len() >= self.capacity {
            self.ids.pop_front();
        }
        self.ids.push_back(id);
    }

    /// Removes and reports whether a confirmation for `id` had arrived.
    /// Unmatched entries are not scrubbed anywhere; they age out by FIFO.
    pub fn take(&mut self, id: u32) -> bool {
        if let Some(pos) = self.ids.iter().position(|&seen| seen == id) {
            self.ids.remove(pos);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D1: MacAddr = MacAddr::new([0xAA, 0, 0, 0, 0, 1]);
    const D2: MacAddr = MacAddr::new([0xAA, 0, 0, 0, 0, 2]);
    const H1: MacAddr = MacAddr::new([0xBB, 0, 0, 0, 0, 1]);
    const H2: MacAddr = MacAddr::new([0xBB, 0, 0, 0, 0, 2]);

    #[test]
    fn seen_window_evicts_oldest_first() {
        let mut seen = SeenIds::new(3);
        for id in 1..=4 {
            assert!(seen.insert_if_new(id));
        }
        // Window held 1,2,3; inserting 4 evicted 1, so 1 is acceptable again.
        assert!(!seen.contains(1));
        assert!(seen.contains(4));
        assert!(seen.insert_if_new(1));
        assert!(!seen.insert_if_new(1));
    }

    #[test]
    fn route_table_keeps_one_entry_per_destination() {
        let mut routes = RouteTable::new(4);
        routes.learn(D1, H1);
        routes.learn(D2, H1);
        routes.learn(D1, H2);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes.next_hop(D1), Some(H2));
        assert_eq!(routes.next_hop(D2), Some(H1));
    }

    #[test]
    fn route_table_evicts_and_invalidates() {
        let mut routes = RouteTable::new(2);
        routes.learn(D1, H1);
        routes.learn(D2, H2);
        routes.learn(MacAddr::new([0xAA, 0, 0, 0, 0, 3]), H1);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes.next_hop(D1), None);

        routes.invalidate(D2);
        assert_eq!(routes.next_hop(D2), None);
        assert_eq!(routes.len(), 1);
    }

    #[test]
    fn confirmations_match_once() {
        let mut confirmed = ConfirmedIds::new(2);
        confirmed.record(10);
        confirmed.record(11);
        confirmed.record(12); // evicts 10
        assert!(!confirmed.take(10));
        assert!(confirmed.take(11));
        assert!(!confirmed.take(11));
        assert!(confirmed.take(12));
    }
}
