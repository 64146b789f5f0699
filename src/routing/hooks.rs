//! Routing-daemon integration
//!
//! `LatencyImport` is what the routing process embeds: peer up/down events
//! register and drop next-hops, path selection queries latencies, and a
//! Change Monitor triggers re-evaluation when measurements move. Failing to
//! attach the table disables the feature; the routing process carries on.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::monitor::{ChangeMonitor, MonitorHandle, SequenceChange, DEFAULT_CHECK_INTERVAL};
use crate::telemetry::{AddOutcome, TelemetryStore, DEFAULT_SHM_PATH, LATENCY_UNMEASURED};

#[derive(Debug, Clone)]
pub struct LatencyImportConfig {
    pub shm_path: PathBuf,
    pub check_interval: Duration,
}

impl Default for LatencyImportConfig {
    fn default() -> Self {
        Self {
            shm_path: PathBuf::from(DEFAULT_SHM_PATH),
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// Same autonomous system (iBGP)
    Internal,
    External,
}

/// What the routing process knows about one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: IpAddr,
    pub kind: PeerKind,
    pub established: bool,
}

impl PeerInfo {
    /// Peers whose next-hops get measured
    pub fn is_candidate(&self) -> bool {
        self.kind == PeerKind::Internal && self.established && self.address.is_ipv4()
    }
}

/// Peer list supplied by the routing process
pub trait PeerSource {
    fn peers(&self) -> Vec<PeerInfo>;
}

impl PeerSource for Vec<PeerInfo> {
    fn peers(&self) -> Vec<PeerInfo> {
        self.clone()
    }
}

type Reevaluate = Arc<dyn Fn(SequenceChange) + Send + Sync>;

pub struct LatencyImport {
    config: LatencyImportConfig,
    store: Arc<TelemetryStore>,
    reevaluate: Reevaluate,
    monitor: Mutex<Option<MonitorHandle>>,
    enabled: AtomicBool,
}

impl LatencyImport {
    /// `reevaluate` runs on the monitor thread after each observed change
    pub fn new<F>(config: LatencyImportConfig, reevaluate: F) -> Self
    where
        F: Fn(SequenceChange) + Send + Sync + 'static,
    {
        let store = Arc::new(TelemetryStore::new(config.shm_path.clone()));
        Self {
            config,
            store,
            reevaluate: Arc::new(reevaluate),
            monitor: Mutex::new(None),
            enabled: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .map(|m| m.is_running())
            .unwrap_or(false)
    }

    /// Enable or disable latency-aware path selection.
    ///
    /// Returns whether the feature is active afterwards.
    pub fn init(&self, enable: bool, peers: &dyn PeerSource) -> bool {
        if !enable {
            info!("Latency import disabled");
            self.enabled.store(false, Ordering::SeqCst);
            self.stop_monitor();
            return false;
        }

        if let Err(e) = self.store.attach() {
            error!(
                "Failed to attach latency table {}: {}; latency import disabled",
                self.config.shm_path.display(),
                e
            );
            self.enabled.store(false, Ordering::SeqCst);
            return false;
        }
        self.enabled.store(true, Ordering::SeqCst);

        let registered = self.collect_nexthops(peers);
        info!("Latency import enabled, {} next-hops registered", registered);

        let mut monitor = self.monitor.lock();
        let running = monitor.as_ref().map(|m| m.is_running()).unwrap_or(false);
        if !running {
            let reevaluate = self.reevaluate.clone();
            match ChangeMonitor::spawn(self.store.clone(), self.config.check_interval, move |change| {
                reevaluate(change)
            }) {
                Ok(handle) => *monitor = Some(handle),
                Err(e) => error!("Failed to start latency change monitor: {}", e),
            }
        }
        true
    }

    /// Register every established iBGP IPv4 peer; returns how many are monitored
    pub fn collect_nexthops(&self, peers: &dyn PeerSource) -> usize {
        peers
            .peers()
            .iter()
            .filter(|p| p.is_candidate())
            .filter_map(|p| self.add(p.address))
            .filter(|outcome| *outcome != AddOutcome::CapacityExceeded)
            .count()
    }

    /// Peer came up
    pub fn add(&self, address: IpAddr) -> Option<AddOutcome> {
        let v4 = self.usable_v4(address)?;
        match self.store.add(v4) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Failed to register next-hop {}: {}", v4, e);
                None
            }
        }
    }

    /// Peer went down
    pub fn remove(&self, address: IpAddr) -> bool {
        let Some(v4) = self.usable_v4(address) else {
            return false;
        };
        match self.store.remove(v4) {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Failed to remove next-hop {}: {}", v4, e);
                false
            }
        }
    }

    /// Latency for path selection; `LATENCY_UNMEASURED` when unknown
    pub fn query(&self, address: IpAddr) -> u32 {
        match self.usable_v4(address) {
            Some(v4) => self.store.query(v4),
            None => LATENCY_UNMEASURED,
        }
    }

    /// Stop the monitor and tear the shared table down
    pub fn cleanup(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.stop_monitor();
        self.store.teardown();
    }

    fn usable_v4(&self, address: IpAddr) -> Option<Ipv4Addr> {
        if !self.is_enabled() {
            return None;
        }
        match address {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(v6) => {
                debug!("Ignoring IPv6 next-hop {}", v6);
                None
            }
        }
    }

    fn stop_monitor(&self) {
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }
}

impl Drop for LatencyImport {
    fn drop(&mut self) {
        self.stop_monitor();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn peer(address: &str, kind: PeerKind, established: bool) -> PeerInfo {
        PeerInfo {
            address: address.parse().unwrap(),
            kind,
            established,
        }
    }

    fn import_at(dir: &std::path::Path) -> LatencyImport {
        let config = LatencyImportConfig {
            shm_path: dir.join("table"),
            check_interval: Duration::from_millis(10),
        };
        LatencyImport::new(config, |_| {})
    }

    #[test]
    fn test_collect_nexthops_filters_peers() {
        let dir = tempdir().unwrap();
        let import = import_at(dir.path());
        let peers = vec![
            peer("10.5.0.1", PeerKind::Internal, true),
            peer("10.5.0.2", PeerKind::External, true),
            peer("10.5.0.3", PeerKind::Internal, false),
            peer("2001:db8::1", PeerKind::Internal, true),
            peer("10.5.0.4", PeerKind::Internal, true),
        ];

        assert!(import.init(true, &peers));
        assert_eq!(
            import.store().active_nexthops().unwrap(),
            vec![Ipv4Addr::new(10, 5, 0, 1), Ipv4Addr::new(10, 5, 0, 4)]
        );
        import.cleanup();
    }

    #[test]
    fn test_disabled_import_answers_sentinel() {
        let dir = tempdir().unwrap();
        let import = import_at(dir.path());
        let a: IpAddr = "10.5.0.1".parse().unwrap();

        assert!(!import.init(false, &Vec::<PeerInfo>::new()));
        assert_eq!(import.add(a), None);
        assert!(!import.remove(a));
        assert_eq!(import.query(a), LATENCY_UNMEASURED);
        assert!(!dir.path().join("table").exists());
    }

    #[test]
    fn test_ipv6_is_ignored() {
        let dir = tempdir().unwrap();
        let import = import_at(dir.path());
        assert!(import.init(true, &Vec::<PeerInfo>::new()));

        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(import.add(v6), None);
        assert_eq!(import.query(v6), LATENCY_UNMEASURED);
        import.cleanup();
    }

    #[test]
    fn test_attach_failure_disables_feature() {
        let dir = tempdir().unwrap();
        let config = LatencyImportConfig {
            shm_path: dir.path().join("missing").join("table"),
            check_interval: Duration::from_millis(10),
        };
        let import = LatencyImport::new(config, |_| {});

        assert!(!import.init(true, &Vec::<PeerInfo>::new()));
        assert!(!import.is_enabled());
        assert!(!import.is_monitoring());
    }

    #[test]
    fn test_reevaluation_after_measurement() {
        let dir = tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let config = LatencyImportConfig {
            shm_path: dir.path().join("table"),
            check_interval: Duration::from_millis(10),
        };
        let import = LatencyImport::new(config, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(import.init(true, &Vec::<PeerInfo>::new()));
        assert!(import.is_monitoring());

        let a = Ipv4Addr::new(10, 5, 0, 9);
        import.add(IpAddr::V4(a));
        import.store().record_measurement(a, 8).unwrap();

        let start = std::time::Instant::now();
        while calls.load(Ordering::SeqCst) == 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(import.query(IpAddr::V4(a)), 8);
        import.cleanup();
    }

    #[test]
    fn test_cleanup_is_repeatable() {
        let dir = tempdir().unwrap();
        let import = import_at(dir.path());
        import.cleanup();
        assert!(import.init(true, &Vec::<PeerInfo>::new()));
        import.cleanup();
        import.cleanup();
        assert!(!import.is_monitoring());
        assert!(!dir.path().join("table").exists());
    }
}
