//! Registry operations on the table body
//!
//! Everything here runs with the shared lock held; the store wraps these in
//! lock acquisition, lifecycle checks and logging.

use std::net::Ipv4Addr;

use super::layout::{encode_addr, NexthopEntry, NexthopTable, LATENCY_UNMEASURED, MAX_NEXTHOPS};

/// Result of registering a next-hop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Appended to a new slot
    Inserted { slot: usize },
    /// Soft-deleted slot switched back on
    Reactivated { slot: usize },
    /// Already monitored, nothing changed
    AlreadyActive { slot: usize },
    /// Table full, the address was dropped
    CapacityExceeded,
}

impl AddOutcome {
    /// True if the call mutated the table
    pub fn changed(&self) -> bool {
        matches!(self, Self::Inserted { .. } | Self::Reactivated { .. })
    }
}

impl NexthopTable {
    /// Zeroed table, as a fresh mapping looks after initialisation
    #[cfg(test)]
    pub(crate) fn boxed_empty() -> Box<Self> {
        Box::new(Self {
            nh_count: 0,
            sequence: 0,
            padding: 0,
            nexthops: [NexthopEntry {
                addr: 0,
                latency_ms: 0,
                active: 0,
                measured: 0,
                padding: [0; 2],
                last_updated: 0,
            }; MAX_NEXTHOPS],
        })
    }

    /// Occupied slots; a corrupt count from another process is clamped
    #[inline]
    pub fn len(&self) -> usize {
        (self.nh_count as usize).min(MAX_NEXTHOPS)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn entries(&self) -> &[NexthopEntry] {
        &self.nexthops[..self.len()]
    }

    fn position(&self, address: Ipv4Addr) -> Option<usize> {
        let raw = encode_addr(address);
        self.entries().iter().position(|e| e.addr == raw)
    }

    #[inline]
    fn bump_sequence(&mut self) {
        self.sequence = self.sequence.wrapping_add(1);
    }

    /// Find-or-append; never evicts
    pub fn add(&mut self, address: Ipv4Addr) -> AddOutcome {
        if let Some(slot) = self.position(address) {
            let entry = &mut self.nexthops[slot];
            if entry.is_active() {
                return AddOutcome::AlreadyActive { slot };
            }
            entry.active = 1;
            self.bump_sequence();
            return AddOutcome::Reactivated { slot };
        }

        let slot = self.len();
        if slot >= MAX_NEXTHOPS {
            return AddOutcome::CapacityExceeded;
        }

        self.nexthops[slot] = NexthopEntry::new(address);
        self.nh_count = (slot + 1) as u32;
        self.bump_sequence();
        AddOutcome::Inserted { slot }
    }

    /// Soft delete: the slot keeps its capacity and last measurement
    pub fn remove(&mut self, address: Ipv4Addr) -> bool {
        match self.position(address) {
            Some(slot) => {
                self.nexthops[slot].active = 0;
                self.bump_sequence();
                true
            }
            None => false,
        }
    }

    /// Latency of an active, measured slot; sentinel otherwise
    pub fn query(&self, address: Ipv4Addr) -> u32 {
        self.position(address)
            .map(|slot| &self.nexthops[slot])
            .filter(|e| e.is_active() && e.is_measured())
            .map(|e| e.latency_ms)
            .unwrap_or(LATENCY_UNMEASURED)
    }

    /// Store a measurement for an active slot.
    ///
    /// The sequence moves only when the value routing sees changes; a repeated
    /// value just refreshes `last_updated`.
    pub fn record(&mut self, address: Ipv4Addr, latency_ms: u32, now: libc::time_t) -> bool {
        let Some(slot) = self.position(address) else {
            return false;
        };
        let entry = &mut self.nexthops[slot];
        if !entry.is_active() {
            return false;
        }

        let changed = !entry.is_measured() || entry.latency_ms != latency_ms;
        entry.latency_ms = latency_ms;
        entry.measured = 1;
        entry.last_updated = now;
        if changed {
            self.bump_sequence();
        }
        true
    }

    /// Forget the measurement of a slot (failure expiry)
    pub fn mark_unmeasured(&mut self, address: Ipv4Addr) -> bool {
        let Some(slot) = self.position(address) else {
            return false;
        };
        let entry = &mut self.nexthops[slot];
        if !entry.is_measured() && entry.latency_ms == LATENCY_UNMEASURED {
            return false;
        }
        entry.measured = 0;
        entry.latency_ms = LATENCY_UNMEASURED;
        self.bump_sequence();
        true
    }

    /// Active addresses in insertion order
    pub fn active(&self) -> Vec<Ipv4Addr> {
        self.entries()
            .iter()
            .filter(|e| e.is_active())
            .map(|e| e.address())
            .collect()
    }

    /// Drop soft-deleted slots, keeping the order of the rest.
    ///
    /// Not part of the registry contract: slot indices change, so callers
    /// must not hold on to them across a compaction.
    pub fn compact(&mut self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let count = self.len();
        let mut kept = 0;
        for slot in 0..count {
            if self.nexthops[slot].is_active() {
                self.nexthops[kept] = self.nexthops[slot];
                kept += 1;
            }
        }

        let reclaimed = count - kept;
        if reclaimed > 0 {
            self.nh_count = kept as u32;
            self.bump_sequence();
        }
        reclaimed
    }
}
