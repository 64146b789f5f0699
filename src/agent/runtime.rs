//! Agent runtime
//!
//! Wires the store, target set, discovery, reflector and sender together on
//! named threads and owns their shutdown.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info, warn};

use super::config::AgentConfig;
use super::discovery::TargetDiscovery;
use super::reflector::{Reflector, ReflectorStats, ReflectorStatsSnapshot};
use super::sender::{Prober, ProberStats, ProberStatsSnapshot};
use super::targets::TargetSet;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::{TableSnapshot, TelemetryStore};

/// Serialisable view for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub reflector_addr: Option<SocketAddr>,
    pub targets: usize,
    pub reflector: Option<ReflectorStatsSnapshot>,
    pub sender: Option<ProberStatsSnapshot>,
    pub table: Option<TableSnapshot>,
}

/// Running measurement agent
pub struct Agent {
    config: AgentConfig,
    store: Arc<TelemetryStore>,
    targets: Arc<TargetSet>,
    shutdown: ShutdownSignal,
    reflector_addr: Option<SocketAddr>,
    reflector_stats: Option<Arc<ReflectorStats>>,
    prober_stats: Option<Arc<ProberStats>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    started_at: DateTime<Utc>,
}

impl Agent {
    /// Attach the table, bind the reflector and start every enabled role
    pub fn start(config: AgentConfig) -> anyhow::Result<Arc<Self>> {
        config.validate().context("Invalid agent configuration")?;

        let store = Arc::new(
            TelemetryStore::open(&config.shm_path)
                .with_context(|| format!("Failed to attach {}", config.shm_path.display()))?,
        );
        let targets = Arc::new(TargetSet::new());
        let shutdown = ShutdownSignal::new();
        let mut threads = Vec::new();

        let mut reflector_addr = None;
        let mut reflector_stats = None;
        if config.reflector_enabled {
            let reflector = Reflector::bind(config.reflector_config(), shutdown.clone())
                .with_context(|| format!("Failed to bind reflector on port {}", config.port))?;
            reflector_addr = Some(reflector.local_addr());
            reflector_stats = Some(reflector.stats());

            let handle = thread::Builder::new()
                .name("twamp-reflector".to_string())
                .spawn(move || {
                    if let Err(e) = reflector.run() {
                        error!("TWAMP reflector terminated: {}", e);
                    }
                })
                .context("Failed to spawn reflector thread")?;
            threads.push(handle);
        }

        let spawned = Self::spawn_measurement(&config, &store, &targets, &shutdown, reflector_addr);
        let prober_stats = match spawned {
            Ok((handles, stats)) => {
                threads.extend(handles);
                stats
            }
            Err(e) => {
                shutdown.cancel();
                for handle in threads {
                    let _ = handle.join();
                }
                return Err(e);
            }
        };

        info!(
            "Measurement agent started (reflector: {}, sender: {})",
            config.reflector_enabled, config.sender_enabled
        );

        Ok(Arc::new(Self {
            config,
            store,
            targets,
            shutdown,
            reflector_addr,
            reflector_stats,
            prober_stats,
            threads: Mutex::new(threads),
            running: AtomicBool::new(true),
            started_at: Utc::now(),
        }))
    }

    fn spawn_measurement(
        config: &AgentConfig,
        store: &Arc<TelemetryStore>,
        targets: &Arc<TargetSet>,
        shutdown: &ShutdownSignal,
        reflector_addr: Option<SocketAddr>,
    ) -> anyhow::Result<(Vec<JoinHandle<()>>, Option<Arc<ProberStats>>)> {
        if !config.sender_enabled {
            return Ok((Vec::new(), None));
        }

        let mut handles = Vec::new();

        let discovery = TargetDiscovery::new(
            store.clone(),
            targets.clone(),
            shutdown.clone(),
            config.discovery_interval,
        );
        handles.push(
            thread::Builder::new()
                .name("twamp-discovery".to_string())
                .spawn(move || discovery.run())
                .context("Failed to spawn discovery thread")?,
        );

        let mut prober_config = config.prober_config();
        if prober_config.port == 0 {
            // Probe the port the local reflector actually got
            if let Some(addr) = reflector_addr {
                prober_config.port = addr.port();
            }
        }
        let prober = Prober::new(prober_config, store.clone(), targets.clone(), shutdown.clone());
        let stats = prober.stats();
        let spawned = thread::Builder::new()
            .name("twamp-sender".to_string())
            .spawn(move || prober.run());
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                shutdown.cancel();
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(e).context("Failed to spawn sender thread");
            }
        }

        Ok((handles, Some(stats)))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    pub fn reflector_addr(&self) -> Option<SocketAddr> {
        self.reflector_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancel every role, wait for the threads and detach the table.
    ///
    /// The table itself stays in place; it belongs to the routing daemon.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping measurement agent");
        self.shutdown.cancel();
        self.targets.notify_all();

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!("Agent thread {} panicked", name);
            }
        }

        self.store.detach();
        info!("Measurement agent stopped");
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            running: self.is_running(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            reflector_addr: self.reflector_addr,
            targets: self.targets.len(),
            reflector: self.reflector_stats.as_ref().map(|s| s.snapshot()),
            sender: self.prober_stats.as_ref().map(|s| s.snapshot()),
            table: self.store.snapshot().ok(),
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> AgentConfig {
        AgentConfig {
            shm_path: dir.join("table"),
            port: 0,
            bind_addr: std::net::Ipv4Addr::LOCALHOST,
            probe_cycle: Duration::from_millis(50),
            idle_wait: Duration::from_millis(20),
            discovery_interval: Duration::from_millis(20),
            reflector_poll: Duration::from_millis(20),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let config = AgentConfig {
            packet_count: 0,
            ..test_config(dir.path())
        };
        assert!(Agent::start(config).is_err());
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let dir = tempdir().unwrap();
        let agent = Agent::start(test_config(dir.path())).unwrap();
        assert!(agent.reflector_addr().is_some());
        assert!(agent.is_running());

        let start = Instant::now();
        agent.stop();
        agent.stop();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!agent.is_running());
        assert!(!agent.store().is_attached());
        // Detach leaves the routing daemon's table in place
        assert!(dir.path().join("table").exists());
    }

    #[test]
    fn test_status_reports_roles() {
        let dir = tempdir().unwrap();
        let config = AgentConfig {
            sender_enabled: false,
            ..test_config(dir.path())
        };
        let agent = Agent::start(config).unwrap();

        let status = agent.status();
        assert!(status.running);
        assert!(status.reflector.is_some());
        assert!(status.sender.is_none());
        assert_eq!(status.table.map(|t| t.count), Some(0));
        agent.stop();
    }
}
