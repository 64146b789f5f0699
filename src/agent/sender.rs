//! Probe sender
//!
//! Measures round-trip latency to every target once per cycle and publishes
//! the aggregated result to the shared table. Per-target failures are logged
//! and never abort a cycle; a target with no replies keeps its last value.

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::AggregationPolicy;
use super::reflector::is_transient;
use super::targets::TargetSet;
use super::wire::{ProbeKind, ProbePacket, TWAMP_PORT};
use crate::shutdown::ShutdownSignal;
use crate::telemetry::{TelemetryStore, LATENCY_UNMEASURED};

const RECV_BUFFER_SIZE: usize = 1500;

#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Reflector port on every target
    pub port: u16,
    pub packet_count: u32,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub cycle_interval: Duration,
    pub idle_wait: Duration,
    pub aggregation: AggregationPolicy,
    pub expire_after_failed_cycles: Option<u32>,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            port: TWAMP_PORT,
            packet_count: 3,
            probe_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(100),
            cycle_interval: Duration::from_secs(60),
            idle_wait: Duration::from_secs(1),
            aggregation: AggregationPolicy::Min,
            expire_after_failed_cycles: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ProberStats {
    pub cycles: AtomicU64,
    pub probes_sent: AtomicU64,
    pub replies_received: AtomicU64,
    pub timeouts: AtomicU64,
    pub stale_replies: AtomicU64,
    pub send_errors: AtomicU64,
    pub measurements_recorded: AtomicU64,
    pub expirations: AtomicU64,
}

impl ProberStats {
    pub fn snapshot(&self) -> ProberStatsSnapshot {
        ProberStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            probes_sent: self.probes_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stale_replies: self.stale_replies.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            measurements_recorded: self.measurements_recorded.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProberStatsSnapshot {
    pub cycles: u64,
    pub probes_sent: u64,
    pub replies_received: u64,
    pub timeouts: u64,
    pub stale_replies: u64,
    pub send_errors: u64,
    pub measurements_recorded: u64,
    pub expirations: u64,
}

/// Outcome of one pass over the target list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Targets with a new measurement written
    pub measured: usize,
    /// Targets with no reply at all
    pub unreachable: usize,
    /// Targets marked unmeasured after repeated failures
    pub expired: usize,
    /// Targets not probed or not written (shutdown, inactive, store error)
    pub skipped: usize,
}

/// Why a single probe produced no sample
#[derive(Debug)]
pub enum ProbeError {
    Timeout,
    Io(io::Error),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "probe timed out"),
            Self::Io(e) => write!(f, "probe socket error: {}", e),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Timeout => None,
        }
    }
}

/// Round to the nearest millisecond, staying clear of the sentinel
pub fn latency_ms(rtt: Duration) -> u32 {
    let ms = (rtt.as_nanos() + 500_000) / 1_000_000;
    ms.min((LATENCY_UNMEASURED - 1) as u128) as u32
}

pub struct Prober {
    config: ProberConfig,
    store: Arc<TelemetryStore>,
    targets: Arc<TargetSet>,
    shutdown: ShutdownSignal,
    stats: Arc<ProberStats>,
    next_seq: AtomicU32,
    /// Consecutive all-timeout cycles per target
    failures: Mutex<HashMap<Ipv4Addr, u32>>,
    start_instant: Instant,
}

impl Prober {
    pub fn new(
        config: ProberConfig,
        store: Arc<TelemetryStore>,
        targets: Arc<TargetSet>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            config,
            store,
            targets,
            shutdown,
            stats: Arc::new(ProberStats::default()),
            next_seq: AtomicU32::new(0),
            failures: Mutex::new(HashMap::new()),
            start_instant: Instant::now(),
        }
    }

    pub fn stats(&self) -> Arc<ProberStats> {
        self.stats.clone()
    }

    /// Sender-local monotonic nanoseconds
    #[inline]
    fn now_ns(&self) -> u64 {
        self.start_instant.elapsed().as_nanos() as u64
    }

    /// Probe cycles until shutdown
    pub fn run(&self) {
        let mut local_targets: Vec<Ipv4Addr> = Vec::new();
        info!(
            "TWAMP sender started: {} probes per target, cycle {:?}",
            self.config.packet_count, self.config.cycle_interval
        );

        loop {
            if !self.targets.wait_for_targets(&self.shutdown, self.config.idle_wait) {
                break;
            }
            if self.targets.take_if_updated(&mut local_targets) {
                debug!("Sender picked up {} targets", local_targets.len());
            }

            if !local_targets.is_empty() {
                let report = self.run_cycle(&local_targets);
                info!(
                    "Probe cycle done: {} measured, {} unreachable, {} expired, {} skipped",
                    report.measured, report.unreachable, report.expired, report.skipped
                );
            }

            if self.shutdown.sleep(self.config.cycle_interval) {
                break;
            }
        }

        info!("TWAMP sender stopped");
    }

    /// Probe every target once and publish the results
    pub fn run_cycle(&self, targets: &[Ipv4Addr]) -> CycleReport {
        let mut report = CycleReport::default();
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.failures.lock().retain(|addr, _| targets.contains(addr));

        let socket = match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to create probe socket: {}", e);
                report.skipped = targets.len();
                return report;
            }
        };

        for (done, &target) in targets.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                report.skipped += targets.len() - done;
                break;
            }

            match self.probe_target(&socket, target) {
                Some(rtt) => {
                    self.failures.lock().remove(&target);
                    self.publish(target, rtt, &mut report);
                }
                None if self.shutdown.is_cancelled() => report.skipped += 1,
                None => {
                    report.unreachable += 1;
                    self.note_failure(target, &mut report);
                }
            }
        }

        report
    }

    fn publish(&self, target: Ipv4Addr, rtt: Duration, report: &mut CycleReport) {
        let ms = latency_ms(rtt);
        match self.store.record_measurement(target, ms) {
            Ok(true) => {
                report.measured += 1;
                self.stats.measurements_recorded.fetch_add(1, Ordering::Relaxed);
                debug!("Next-hop {} latency {} ms ({:?})", target, ms, rtt);
            }
            Ok(false) => {
                report.skipped += 1;
                debug!("Next-hop {} no longer active, measurement dropped", target);
            }
            Err(e) => {
                report.skipped += 1;
                warn!("Failed to record latency for {}: {}", target, e);
            }
        }
    }

    fn note_failure(&self, target: Ipv4Addr, report: &mut CycleReport) {
        let failed_cycles = {
            let mut failures = self.failures.lock();
            let count = failures.entry(target).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        warn!(
            "Next-hop {} unreachable ({} consecutive cycles), keeping last value",
            target, failed_cycles
        );

        let Some(limit) = self.config.expire_after_failed_cycles else {
            return;
        };
        if failed_cycles < limit {
            return;
        }
        match self.store.mark_unmeasured(target) {
            Ok(true) => {
                report.expired += 1;
                self.stats.expirations.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Next-hop {} marked unmeasured after {} failed cycles",
                    target, failed_cycles
                );
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to expire latency for {}: {}", target, e),
        }
    }

    /// Send `packet_count` probes and aggregate the replies
    pub fn probe_target(&self, socket: &UdpSocket, target: Ipv4Addr) -> Option<Duration> {
        let dest = SocketAddr::V4(SocketAddrV4::new(target, self.config.port));
        let mut samples = Vec::with_capacity(self.config.packet_count as usize);

        for i in 0..self.config.packet_count {
            if i > 0 && self.shutdown.sleep(self.config.probe_interval) {
                break;
            }

            match self.probe_once(socket, dest) {
                Ok(rtt) => samples.push(rtt),
                Err(ProbeError::Timeout) => {
                    debug!("Probe {} to {} timed out", i + 1, dest);
                }
                Err(e) => {
                    warn!("Probe {} to {} failed: {}", i + 1, dest, e);
                }
            }
        }

        self.config.aggregation.aggregate(&samples)
    }

    /// One request/reply exchange bounded by `probe_timeout`.
    ///
    /// Replies that do not match the outstanding request (late answers to an
    /// earlier probe, foreign traffic) are discarded while waiting.
    pub fn probe_once(&self, socket: &UdpSocket, dest: SocketAddr) -> Result<Duration, ProbeError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let request = ProbePacket::request(seq, self.now_ns());

        if let Err(e) = socket.send_to(&request.to_bytes(), dest) {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(ProbeError::Io(e));
        }
        self.stats.probes_sent.fetch_add(1, Ordering::Relaxed);

        let deadline = Instant::now() + self.config.probe_timeout;
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(ProbeError::Timeout);
            }
            socket
                .set_read_timeout(Some(remaining))
                .map_err(ProbeError::Io)?;

            match socket.recv_from(&mut buf) {
                Ok((n, _from)) => {
                    let recv_ns = self.now_ns();
                    match ProbePacket::try_from_slice(&buf[..n]) {
                        Ok(reply)
                            if reply.kind == ProbeKind::Reply
                                && reply.seq == request.seq
                                && reply.sender_ts_ns == request.sender_ts_ns =>
                        {
                            self.stats.replies_received.fetch_add(1, Ordering::Relaxed);
                            return Ok(reply.round_trip(recv_ns));
                        }
                        _ => {
                            self.stats.stale_replies.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(ProbeError::Timeout);
                }
                // ICMP errors from earlier probes surface here; keep waiting
                Err(e) if is_transient(&e) => {}
                Err(e) => return Err(ProbeError::Io(e)),
            }
        }
    }
}
