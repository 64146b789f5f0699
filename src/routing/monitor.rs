//! Change Monitor
//!
//! Polls the shared table's sequence counter and asks the routing process to
//! re-run best-path selection whenever it moves.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownSignal;
use crate::telemetry::{TelemetryError, TelemetryStore};

/// Poll period of the routing side
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Observed movement of the sequence counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceChange {
    pub previous: u32,
    pub current: u32,
}

/// Last sequence value seen by one observer
#[derive(Debug, Default, Clone)]
pub struct SequenceWatch {
    last: u32,
}

impl SequenceWatch {
    /// Starts at 0, so a table that already changed fires on the first poll
    pub fn new() -> Self {
        Self::default()
    }

    /// Any difference counts, including a wrap past zero
    pub fn observe(&mut self, current: u32) -> Option<SequenceChange> {
        if current == self.last {
            return None;
        }
        let change = SequenceChange {
            previous: self.last,
            current,
        };
        self.last = current;
        Some(change)
    }
}

pub struct ChangeMonitor;

impl ChangeMonitor {
    /// Start polling on a named thread.
    ///
    /// The monitor stops by itself when the store is no longer attached.
    pub fn spawn<F>(
        store: Arc<TelemetryStore>,
        interval: Duration,
        callback: F,
    ) -> io::Result<MonitorHandle>
    where
        F: Fn(SequenceChange) + Send + 'static,
    {
        let shutdown = ShutdownSignal::new();
        let running = Arc::new(AtomicBool::new(true));

        let thread_shutdown = shutdown.clone();
        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name("latency-monitor".to_string())
            .spawn(move || {
                poll_loop(&store, interval, &thread_shutdown, callback);
                thread_running.store(false, Ordering::SeqCst);
            })?;

        info!("Latency change monitor started (interval {:?})", interval);

        Ok(MonitorHandle {
            shutdown,
            running,
            thread: Mutex::new(Some(handle)),
        })
    }
}

fn poll_loop<F>(store: &TelemetryStore, interval: Duration, shutdown: &ShutdownSignal, callback: F)
where
    F: Fn(SequenceChange),
{
    let mut watch = SequenceWatch::new();

    while !shutdown.wait_timeout(interval) {
        match store.sequence() {
            Ok(current) => {
                if let Some(change) = watch.observe(current) {
                    debug!(
                        "Latency data changed (sequence {} -> {}), triggering re-evaluation",
                        change.previous, change.current
                    );
                    callback(change);
                }
            }
            Err(TelemetryError::NotAttached) => {
                debug!("Telemetry table detached, monitor exiting");
                break;
            }
            Err(e) => warn!("Failed to read latency sequence: {}", e),
        }
    }

    info!("Latency change monitor stopped");
}

/// Owner of a running monitor; stops it on drop
pub struct MonitorHandle {
    shutdown: ShutdownSignal,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorHandle {
    /// Ask the monitor to stop without waiting for it
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cancel and join.
    ///
    /// Called from inside the callback it only cancels: the thread cannot
    /// join itself.
    pub fn stop(&self) {
        self.cancel();
        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("Latency change monitor panicked");
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::Ipv4Addr, sync::mpsc, time::Instant};
    use tempfile::tempdir;

    #[test]
    fn test_watch_reports_only_changes() {
        let mut watch = SequenceWatch::new();
        assert_eq!(watch.observe(0), None);
        assert_eq!(
            watch.observe(3),
            Some(SequenceChange { previous: 0, current: 3 })
        );
        assert_eq!(watch.observe(3), None);

        let mut wrapped = SequenceWatch::new();
        wrapped.observe(u32::MAX);
        assert_eq!(
            wrapped.observe(0),
            Some(SequenceChange { previous: u32::MAX, current: 0 })
        );
    }

    #[test]
    fn test_monitor_fires_on_change() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TelemetryStore::open(dir.path().join("table")).unwrap());
        let (tx, rx) = mpsc::channel();

        let monitor = ChangeMonitor::spawn(store.clone(), Duration::from_millis(10), move |c| {
            let _ = tx.send(c);
        })
        .unwrap();

        store.add(Ipv4Addr::new(10, 4, 0, 1)).unwrap();
        let change = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(change.current, store.sequence().unwrap());

        monitor.stop();
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_monitor_exits_when_detached() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TelemetryStore::open(dir.path().join("table")).unwrap());
        let monitor = ChangeMonitor::spawn(store.clone(), Duration::from_millis(10), |_| {}).unwrap();

        store.detach();
        let start = Instant::now();
        while monitor.is_running() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_stop_does_not_wait_for_interval() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TelemetryStore::open(dir.path().join("table")).unwrap());
        let monitor = ChangeMonitor::spawn(store, Duration::from_secs(60), |_| {}).unwrap();

        let start = Instant::now();
        drop(monitor);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
