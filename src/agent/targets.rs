//! Candidate target set shared by discovery and the sender

use std::{collections::BTreeSet, net::Ipv4Addr, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::shutdown::ShutdownSignal;

#[derive(Debug, Default)]
struct Targets {
    peers: BTreeSet<Ipv4Addr>,
    updated: bool,
}

/// Set of next-hops to probe, with a change flag for copy-on-read
#[derive(Debug, Default)]
pub struct TargetSet {
    state: Mutex<Targets>,
    changed: Condvar,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole set; true if membership changed
    pub fn sync<I>(&self, peers: I) -> bool
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        let next: BTreeSet<Ipv4Addr> = peers.into_iter().collect();
        let mut state = self.state.lock();
        if state.peers == next {
            return false;
        }
        state.peers = next;
        state.updated = true;
        self.changed.notify_all();
        true
    }

    pub fn len(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().peers.is_empty()
    }

    /// Block while the set is empty.
    ///
    /// Each wait is bounded by `granularity` so a cancelled `shutdown` is
    /// noticed even if nobody notifies. Returns true once targets exist.
    pub fn wait_for_targets(&self, shutdown: &ShutdownSignal, granularity: Duration) -> bool {
        let mut state = self.state.lock();
        while state.peers.is_empty() {
            if shutdown.is_cancelled() {
                return false;
            }
            self.changed.wait_for(&mut state, granularity);
        }
        !shutdown.is_cancelled()
    }

    /// Copy the set into `out` if it changed since the last call
    pub fn take_if_updated(&self, out: &mut Vec<Ipv4Addr>) -> bool {
        let mut state = self.state.lock();
        if !state.updated {
            return false;
        }
        out.clear();
        out.extend(state.peers.iter().copied());
        state.updated = false;
        true
    }

    /// Wake every waiter, e.g. on shutdown
    pub fn notify_all(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }
}
