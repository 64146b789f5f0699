//! Telemetry Store handle
//!
//! Owns the lifecycle of one attachment to the shared table and exposes the
//! registry operations. Every operation holds the cross-process lock for its
//! whole duration; the table is small, so a linear scan under one coarse lock
//! is cheap.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::TelemetryError;
use super::layout::{NexthopTable, LATENCY_UNMEASURED, MAX_NEXTHOPS};
use super::region::SharedRegion;
use super::table::AddOutcome;

/// Externally visible lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    Uninitialized,
    Attached,
    Detached,
}

enum Lifecycle {
    Uninitialized,
    Attached(SharedRegion),
    Detached,
}

/// One slot as seen by operators and status endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NexthopRecord {
    pub slot: usize,
    pub address: Ipv4Addr,
    /// None while unmeasured
    pub latency_ms: Option<u32>,
    pub active: bool,
    pub measured: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Consistent copy of the whole table
#[derive(Debug, Clone, Serialize)]
pub struct TableSnapshot {
    pub capacity: usize,
    pub count: usize,
    pub sequence: u32,
    pub entries: Vec<NexthopRecord>,
}

impl TableSnapshot {
    fn capture(table: &NexthopTable) -> Self {
        let entries = table
            .entries()
            .iter()
            .enumerate()
            .map(|(slot, e)| NexthopRecord {
                slot,
                address: e.address(),
                latency_ms: (e.latency_ms != LATENCY_UNMEASURED).then_some(e.latency_ms),
                active: e.is_active(),
                measured: e.is_measured(),
                last_updated: (e.last_updated != 0)
                    .then(|| DateTime::from_timestamp(e.last_updated as i64, 0))
                    .flatten(),
            })
            .collect();

        Self {
            capacity: MAX_NEXTHOPS,
            count: table.len(),
            sequence: table.sequence,
            entries,
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }

    pub fn measured_count(&self) -> usize {
        self.entries.iter().filter(|e| e.active && e.measured).count()
    }
}

/// Handle on the shared next-hop table
pub struct TelemetryStore {
    path: PathBuf,
    lifecycle: RwLock<Lifecycle>,
}

impl std::fmt::Debug for TelemetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStore")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}

impl TelemetryStore {
    /// Unattached handle for the backing object at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
        }
    }

    /// Create a handle and attach it
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TelemetryError> {
        let store = Self::new(path);
        store.attach()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> StoreState {
        match &*self.lifecycle.read() {
            Lifecycle::Uninitialized => StoreState::Uninitialized,
            Lifecycle::Attached(_) => StoreState::Attached,
            Lifecycle::Detached => StoreState::Detached,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.state() == StoreState::Attached
    }

    /// Create or attach the shared region.
    ///
    /// Idempotent: an existing attachment is only re-validated and live state
    /// is never re-initialised. Returns true when a new mapping was made.
    pub fn attach(&self) -> Result<bool, TelemetryError> {
        let mut lifecycle = self.lifecycle.write();

        if let Lifecycle::Attached(region) = &*lifecycle {
            if region.is_current(&self.path) {
                debug!("Telemetry table {} already attached", self.path.display());
                return Ok(false);
            }
            warn!(
                "Telemetry table {} was replaced or removed, re-attaching",
                self.path.display()
            );
        }

        let (region, created) = SharedRegion::open(&self.path)?;
        if created {
            info!("Telemetry table initialized at {}", self.path.display());
        } else {
            info!("Attached to telemetry table at {}", self.path.display());
        }
        *lifecycle = Lifecycle::Attached(region);
        Ok(true)
    }

    /// Unmap without touching the lock or the backing object
    pub fn detach(&self) -> bool {
        let mut lifecycle = self.lifecycle.write();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Detached) {
            Lifecycle::Attached(_) => {
                info!("Detached from telemetry table {}", self.path.display());
                true
            }
            previous => {
                *lifecycle = previous;
                false
            }
        }
    }

    /// Destroy the lock, unmap and unlink the backing object.
    ///
    /// Safe to call repeatedly and on a handle that never attached.
    pub fn teardown(&self) -> bool {
        let mut lifecycle = self.lifecycle.write();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Detached) {
            Lifecycle::Attached(region) => {
                region.destroy_lock();
                drop(region);
                match std::fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to unlink {}: {}", self.path.display(), e),
                }
                info!("Cleaned up telemetry table {}", self.path.display());
                true
            }
            previous => {
                *lifecycle = previous;
                debug!("Telemetry table {}: nothing to clean up", self.path.display());
                false
            }
        }
    }

    fn with_table<R>(&self, op: impl FnOnce(&mut NexthopTable) -> R) -> Result<R, TelemetryError> {
        let lifecycle = self.lifecycle.read();
        let Lifecycle::Attached(region) = &*lifecycle else {
            return Err(TelemetryError::NotAttached);
        };
        let mut table = region.lock()?;
        Ok(op(&mut table))
    }

    /// Register a next-hop for monitoring
    pub fn add(&self, address: Ipv4Addr) -> Result<AddOutcome, TelemetryError> {
        let outcome = self.with_table(|t| t.add(address))?;
        match outcome {
            AddOutcome::Inserted { slot } => {
                info!("Added next-hop {} for monitoring (slot {})", address, slot)
            }
            AddOutcome::Reactivated { slot } => {
                info!("Reactivated next-hop {} (slot {})", address, slot)
            }
            AddOutcome::AlreadyActive { .. } => debug!("Next-hop {} already monitored", address),
            AddOutcome::CapacityExceeded => warn!(
                "Max next-hops ({}) reached, cannot add {}",
                MAX_NEXTHOPS, address
            ),
        }
        Ok(outcome)
    }

    /// Stop monitoring a next-hop; its slot is kept
    pub fn remove(&self, address: Ipv4Addr) -> Result<bool, TelemetryError> {
        let removed = self.with_table(|t| t.remove(address))?;
        if removed {
            info!("Removed next-hop {} from monitoring", address);
        }
        Ok(removed)
    }

    /// Latency in ms, or `LATENCY_UNMEASURED` for anything not active and measured
    pub fn query(&self, address: Ipv4Addr) -> u32 {
        self.with_table(|t| t.query(address))
            .unwrap_or(LATENCY_UNMEASURED)
    }

    /// Current change sequence
    pub fn sequence(&self) -> Result<u32, TelemetryError> {
        self.with_table(|t| t.sequence)
    }

    /// Publish a measurement; false if the next-hop is no longer active
    pub fn record_measurement(&self, address: Ipv4Addr, latency_ms: u32) -> Result<bool, TelemetryError> {
        let now = Utc::now().timestamp() as libc::time_t;
        self.with_table(|t| t.record(address, latency_ms, now))
    }

    /// Reset a next-hop to unmeasured
    pub fn mark_unmeasured(&self, address: Ipv4Addr) -> Result<bool, TelemetryError> {
        self.with_table(|t| t.mark_unmeasured(address))
    }

    /// Active next-hops in insertion order
    pub fn active_nexthops(&self) -> Result<Vec<Ipv4Addr>, TelemetryError> {
        self.with_table(|t| t.active())
    }

    pub fn snapshot(&self) -> Result<TableSnapshot, TelemetryError> {
        self.with_table(|t| TableSnapshot::capture(t))
    }

    /// Reclaim soft-deleted slots (operator action, never implicit)
    pub fn compact(&self) -> Result<usize, TelemetryError> {
        let reclaimed = self.with_table(|t| t.compact())?;
        if reclaimed > 0 {
            info!("Reclaimed {} soft-deleted slots", reclaimed);
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_teardown_without_attach_is_noop() {
        let dir = tempdir().unwrap();
        let store = TelemetryStore::new(dir.path().join("table"));

        assert!(!store.teardown());
        assert!(!store.teardown());
        assert_eq!(store.state(), StoreState::Uninitialized);
        assert!(!dir.path().join("table").exists());
    }

    #[test]
    fn test_operations_require_attach() {
        let dir = tempdir().unwrap();
        let store = TelemetryStore::new(dir.path().join("table"));
        let a = Ipv4Addr::new(10, 0, 0, 1);

        assert!(matches!(store.add(a), Err(TelemetryError::NotAttached)));
        assert!(matches!(store.sequence(), Err(TelemetryError::NotAttached)));
        assert_eq!(store.query(a), LATENCY_UNMEASURED);
    }

    #[test]
    fn test_attach_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = TelemetryStore::new(dir.path().join("table"));

        assert!(store.attach().unwrap());
        store.add(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        let seq = store.sequence().unwrap();

        assert!(!store.attach().unwrap());
        assert_eq!(store.sequence().unwrap(), seq);
        assert_eq!(store.active_nexthops().unwrap().len(), 1);
    }

    #[test]
    fn test_second_attach_reuses_live_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table");
        let first = TelemetryStore::open(&path).unwrap();
        let a = Ipv4Addr::new(10, 0, 0, 1);
        first.add(a).unwrap();
        first.record_measurement(a, 17).unwrap();

        let second = TelemetryStore::open(&path).unwrap();
        assert_eq!(second.query(a), 17);
        assert_eq!(second.sequence().unwrap(), first.sequence().unwrap());
    }

    #[test]
    fn test_teardown_unlinks_and_allows_reattach() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table");
        let store = TelemetryStore::open(&path).unwrap();
        store.add(Ipv4Addr::new(10, 0, 0, 1)).unwrap();

        assert!(store.teardown());
        assert_eq!(store.state(), StoreState::Detached);
        assert!(!path.exists());
        assert!(!store.teardown());

        assert!(store.attach().unwrap());
        assert_eq!(store.sequence().unwrap(), 0);
        assert!(store.active_nexthops().unwrap().is_empty());
    }

    #[test]
    fn test_attach_follows_replaced_backing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table");
        let routing = TelemetryStore::open(&path).unwrap();
        let agent = TelemetryStore::open(&path).unwrap();
        routing.add(Ipv4Addr::new(10, 0, 0, 1)).unwrap();

        // Another process tears the table down and a fresh one is created
        routing.teardown();
        let fresh = TelemetryStore::open(&path).unwrap();
        fresh.add(Ipv4Addr::new(10, 0, 0, 2)).unwrap();

        assert!(agent.attach().unwrap());
        assert_eq!(agent.active_nexthops().unwrap(), vec![Ipv4Addr::new(10, 0, 0, 2)]);
    }

    #[test]
    fn test_size_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table");
        std::fs::write(&path, b"not a telemetry table").unwrap();

        let store = TelemetryStore::new(&path);
        assert!(matches!(
            store.attach(),
            Err(TelemetryError::SizeMismatch { .. })
        ));
        assert!(!store.is_attached());
    }

    #[test]
    fn test_snapshot_reports_measurements() {
        let dir = tempdir().unwrap();
        let store = TelemetryStore::open(dir.path().join("table")).unwrap();
        let a = Ipv4Addr::new(10, 0, 0, 1);
        let b = Ipv4Addr::new(10, 0, 0, 2);
        store.add(a).unwrap();
        store.add(b).unwrap();
        store.record_measurement(a, 4).unwrap();
        store.remove(b).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.active_count(), 1);
        assert_eq!(snapshot.measured_count(), 1);
        assert_eq!(snapshot.entries[0].latency_ms, Some(4));
        assert!(snapshot.entries[0].last_updated.is_some());
        assert_eq!(snapshot.entries[1].latency_ms, None);
    }
}
