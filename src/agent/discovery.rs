//! Target discovery
//!
//! Polls the shared table and mirrors its active next-hops into the
//! `TargetSet`. The sequence counter makes a poll with no changes a single
//! locked read.

use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use super::targets::TargetSet;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::{TelemetryError, TelemetryStore};

pub struct TargetDiscovery {
    store: Arc<TelemetryStore>,
    targets: Arc<TargetSet>,
    shutdown: ShutdownSignal,
    interval: Duration,
}

impl TargetDiscovery {
    pub fn new(
        store: Arc<TelemetryStore>,
        targets: Arc<TargetSet>,
        shutdown: ShutdownSignal,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            targets,
            shutdown,
            interval,
        }
    }

    /// One poll; `last_seen` is None until the first successful read.
    ///
    /// Returns true when the target set changed.
    pub fn refresh(&self, last_seen: &mut Option<u32>) -> Result<bool, TelemetryError> {
        let sequence = self.store.sequence()?;
        if *last_seen == Some(sequence) {
            return Ok(false);
        }

        let active = self.store.active_nexthops()?;
        *last_seen = Some(sequence);
        let count = active.len();
        let changed = self.targets.sync(active);
        if changed {
            info!("Target set updated: {} next-hops (sequence {})", count, sequence);
        } else if self.targets.is_empty() {
            debug!("No next-hops registered yet (sequence {})", sequence);
        }
        Ok(changed)
    }

    /// Re-attach if the routing side recreated the table, then refresh.
    ///
    /// A fresh mapping forgets `last_seen` so its next-hops are read in full.
    pub fn poll(&self, last_seen: &mut Option<u32>) -> Result<bool, TelemetryError> {
        if self.store.attach()? {
            *last_seen = None;
        }
        self.refresh(last_seen)
    }

    /// Poll until shutdown
    pub fn run(self) {
        let mut last_seen = None;
        info!("Target discovery started (interval {:?})", self.interval);

        loop {
            match self.poll(&mut last_seen) {
                Ok(_) => {}
                Err(TelemetryError::NotAttached) => {
                    debug!("Telemetry table not attached, skipping discovery poll");
                }
                Err(e) => warn!("Target discovery failed: {}", e),
            }

            if self.shutdown.sleep(self.interval) {
                break;
            }
        }

        info!("Target discovery stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::tempdir;

    #[test]
    fn test_refresh_follows_sequence() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TelemetryStore::open(dir.path().join("table")).unwrap());
        let targets = Arc::new(TargetSet::new());
        let discovery = TargetDiscovery::new(
            store.clone(),
            targets.clone(),
            ShutdownSignal::new(),
            Duration::from_millis(10),
        );
        let a = Ipv4Addr::new(10, 3, 0, 1);
        let b = Ipv4Addr::new(10, 3, 0, 2);
        let mut last_seen = None;

        // Empty table: first poll records the sequence but changes nothing
        assert!(!discovery.refresh(&mut last_seen).unwrap());
        assert_eq!(last_seen, Some(0));

        store.add(a).unwrap();
        store.add(b).unwrap();
        assert!(discovery.refresh(&mut last_seen).unwrap());
        assert_eq!(targets.len(), 2);
        assert!(!discovery.refresh(&mut last_seen).unwrap());

        store.remove(a).unwrap();
        assert!(discovery.refresh(&mut last_seen).unwrap());
        let mut local = Vec::new();
        targets.take_if_updated(&mut local);
        assert_eq!(local, vec![b]);
    }

    #[test]
    fn test_poll_follows_recreated_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table");
        let store = Arc::new(TelemetryStore::open(&path).unwrap());
        let targets = Arc::new(TargetSet::new());
        let discovery = TargetDiscovery::new(
            store.clone(),
            targets.clone(),
            ShutdownSignal::new(),
            Duration::from_millis(10),
        );
        let a = Ipv4Addr::new(10, 3, 1, 1);
        let b = Ipv4Addr::new(10, 3, 1, 2);

        let routing = TelemetryStore::open(&path).unwrap();
        routing.add(a).unwrap();
        let mut last_seen = None;
        assert!(discovery.poll(&mut last_seen).unwrap());

        // Routing daemon restart: old table gone, new one with a different next-hop
        assert!(routing.teardown());
        let routing = TelemetryStore::open(&path).unwrap();
        routing.add(b).unwrap();

        assert!(discovery.poll(&mut last_seen).unwrap());
        let mut local = Vec::new();
        targets.take_if_updated(&mut local);
        assert_eq!(local, vec![b]);

        // Measurements land in the table routing now reads
        store.record_measurement(b, 7).unwrap();
        assert_eq!(routing.query(b), 7);
    }

    #[test]
    fn test_refresh_requires_attached_store() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TelemetryStore::new(dir.path().join("table")));
        let discovery = TargetDiscovery::new(
            store,
            Arc::new(TargetSet::new()),
            ShutdownSignal::new(),
            Duration::from_millis(10),
        );

        let mut last_seen = None;
        assert!(matches!(
            discovery.refresh(&mut last_seen),
            Err(TelemetryError::NotAttached)
        ));
        assert_eq!(last_seen, None);
    }
}
