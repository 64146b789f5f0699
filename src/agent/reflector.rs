//! TWAMP-light reflector
//!
//! Answers every valid probe request with a reply that echoes the sender's
//! sequence and timestamp and adds its own receive/transmit timestamps. Runs
//! on a dedicated thread; the receive timeout bounds how long a shutdown
//! request can go unnoticed.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::wire::{ProbeKind, ProbePacket, TWAMP_PORT};
use crate::shutdown::ShutdownSignal;

/// Receive buffer; larger than a probe so padded datagrams fit
const RECV_BUFFER_SIZE: usize = 1500;

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    pub bind_addr: SocketAddr,
    /// Receive timeout between shutdown checks
    pub poll_interval: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], TWAMP_PORT)),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReflectorStats {
    pub requests_received: AtomicU64,
    pub replies_sent: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub recv_errors: AtomicU64,
    pub send_errors: AtomicU64,
    pub rebinds: AtomicU64,
}

impl ReflectorStats {
    pub fn snapshot(&self) -> ReflectorStatsSnapshot {
        ReflectorStatsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            rebinds: self.rebinds.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReflectorStatsSnapshot {
    pub requests_received: u64,
    pub replies_sent: u64,
    pub malformed_packets: u64,
    pub recv_errors: u64,
    pub send_errors: u64,
    pub rebinds: u64,
}

/// Bound reflector, ready to run
pub struct Reflector {
    config: ReflectorConfig,
    socket: Option<UdpSocket>,
    local_addr: SocketAddr,
    shutdown: ShutdownSignal,
    stats: Arc<ReflectorStats>,
    start_instant: Instant,
    fatal_in_row: u32,
}

impl Reflector {
    /// Bind the listening socket
    pub fn bind(config: ReflectorConfig, shutdown: ShutdownSignal) -> io::Result<Self> {
        let socket = open_socket(config.bind_addr, config.poll_interval)?;
        let local_addr = socket.local_addr()?;
        info!("TWAMP reflector listening on {}", local_addr);

        Ok(Self {
            config,
            socket: Some(socket),
            local_addr,
            shutdown,
            stats: Arc::new(ReflectorStats::default()),
            start_instant: Instant::now(),
            fatal_in_row: 0,
        })
    }

    /// Actual bound address (resolves an ephemeral port)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ReflectorStats> {
        self.stats.clone()
    }

    /// Reflector-local monotonic nanoseconds
    #[inline]
    fn now_ns(&self) -> u64 {
        self.start_instant.elapsed().as_nanos() as u64
    }

    /// Serve until shutdown.
    ///
    /// A socket-fatal error triggers one rebind on the same address; a
    /// second fatal error in a row, or a failed rebind, ends the role.
    pub fn run(mut self) -> io::Result<()> {
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        while !self.shutdown.is_cancelled() {
            let Some(socket) = self.socket.as_ref() else {
                break;
            };

            let outcome = match socket.recv_from(&mut buf) {
                Ok((n, peer)) => {
                    let rx_ns = self.now_ns();
                    self.reflect(socket, &buf[..n], peer, rx_ns)
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => self.fatal_in_row = 0,
                Err(e) => self.handle_error(e)?,
            }
        }

        info!("TWAMP reflector stopped");
        Ok(())
    }

    /// Classify one socket error; `Err` ends the role
    fn handle_error(&mut self, e: io::Error) -> io::Result<()> {
        if is_timeout(&e) {
            return Ok(());
        }
        self.stats.recv_errors.fetch_add(1, Ordering::Relaxed);
        if is_transient(&e) {
            debug!("Reflector transient socket error: {}", e);
            return Ok(());
        }

        self.fatal_in_row += 1;
        if self.fatal_in_row > 1 {
            error!("Reflector socket failed again, giving up: {}", e);
            return Err(e);
        }
        warn!("Reflector socket error, rebinding {}: {}", self.local_addr, e);
        self.rebind()
    }

    /// Answer one datagram; malformed input and send hiccups are absorbed
    fn reflect(
        &self,
        socket: &UdpSocket,
        datagram: &[u8],
        peer: SocketAddr,
        rx_ns: u64,
    ) -> io::Result<()> {
        let request = match ProbePacket::try_from_slice(datagram) {
            Ok(p) if p.kind == ProbeKind::Request => p,
            Ok(_) => {
                self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
                debug!("Ignoring non-request probe from {}", peer);
                return Ok(());
            }
            Err(e) => {
                self.stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
                debug!("Malformed probe from {}: {}", peer, e);
                return Ok(());
            }
        };
        self.stats.requests_received.fetch_add(1, Ordering::Relaxed);

        let reply = request.reply(rx_ns, self.now_ns());
        match socket.send_to(&reply.to_bytes(), peer) {
            Ok(_) => {
                self.stats.replies_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if is_transient(&e) || is_timeout(&e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Failed to reflect probe to {}: {}", peer, e);
                Ok(())
            }
            Err(e) => {
                self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn rebind(&mut self) -> io::Result<()> {
        // Release the port before binding it again
        self.socket = None;
        self.stats.rebinds.fetch_add(1, Ordering::Relaxed);

        match open_socket(self.local_addr, self.config.poll_interval) {
            Ok(socket) => {
                info!("TWAMP reflector rebound on {}", self.local_addr);
                self.socket = Some(socket);
                Ok(())
            }
            Err(e) => {
                error!("Reflector rebind on {} failed: {}", self.local_addr, e);
                Err(e)
            }
        }
    }
}

fn open_socket(addr: SocketAddr, poll_interval: Duration) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_read_timeout(Some(poll_interval))?;
    Ok(socket)
}

#[inline]
fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Errors that say nothing about the health of the socket itself
pub(crate) fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::PermissionDenied
    ) {
        return true;
    }
    matches!(
        e.raw_os_error(),
        Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) | Some(libc::ENOBUFS) | Some(libc::EMSGSIZE)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn loopback_config() -> ReflectorConfig {
        ReflectorConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_reflects_request() {
        let shutdown = ShutdownSignal::new();
        let reflector = Reflector::bind(loopback_config(), shutdown.clone()).unwrap();
        let addr = reflector.local_addr();
        let stats = reflector.stats();
        let handle = thread::spawn(move || reflector.run());

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client
            .send_to(&ProbePacket::request(11, 123_456).to_bytes(), addr)
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        let reply = ProbePacket::try_from_slice(&buf[..n]).unwrap();
        assert_eq!(reply.kind, ProbeKind::Reply);
        assert_eq!(reply.seq, 11);
        assert_eq!(reply.sender_ts_ns, 123_456);
        assert!(reply.reflector_tx_ns >= reply.reflector_rx_ns);

        shutdown.cancel();
        handle.join().unwrap().unwrap();
        assert_eq!(stats.snapshot().replies_sent, 1);
    }

    #[test]
    fn test_skips_malformed_and_keeps_serving() {
        let shutdown = ShutdownSignal::new();
        let reflector = Reflector::bind(loopback_config(), shutdown.clone()).unwrap();
        let addr = reflector.local_addr();
        let stats = reflector.stats();
        let handle = thread::spawn(move || reflector.run());

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.send_to(b"garbage", addr).unwrap();
        // A reply is not a request either
        let stray = ProbePacket::request(1, 1).reply(2, 3);
        client.send_to(&stray.to_bytes(), addr).unwrap();
        client.send_to(&ProbePacket::request(2, 5).to_bytes(), addr).unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(ProbePacket::try_from_slice(&buf[..n]).unwrap().seq, 2);

        shutdown.cancel();
        handle.join().unwrap().unwrap();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.malformed_packets, 2);
        assert_eq!(snapshot.requests_received, 1);
    }

    #[test]
    fn test_run_returns_promptly_on_shutdown() {
        let shutdown = ShutdownSignal::new();
        let reflector = Reflector::bind(loopback_config(), shutdown.clone()).unwrap();
        let handle = thread::spawn(move || reflector.run());

        let start = Instant::now();
        shutdown.cancel();
        handle.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_fatal_error_rebinds_and_keeps_serving() {
        let shutdown = ShutdownSignal::new();
        let mut reflector = Reflector::bind(loopback_config(), shutdown.clone()).unwrap();
        let addr = reflector.local_addr();
        let stats = reflector.stats();

        reflector
            .handle_error(io::Error::from_raw_os_error(libc::EBADF))
            .unwrap();
        assert_eq!(stats.snapshot().rebinds, 1);
        assert_eq!(reflector.local_addr(), addr);

        let handle = thread::spawn(move || reflector.run());
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client
            .send_to(&ProbePacket::request(4, 99).to_bytes(), addr)
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(ProbePacket::try_from_slice(&buf[..n]).unwrap().seq, 4);

        shutdown.cancel();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_second_fatal_error_in_row_ends_role() {
        let mut reflector = Reflector::bind(loopback_config(), ShutdownSignal::new()).unwrap();
        let stats = reflector.stats();

        // Timeouts and transient errors never count towards a rebind
        reflector
            .handle_error(io::Error::from(io::ErrorKind::WouldBlock))
            .unwrap();
        reflector
            .handle_error(io::Error::from(io::ErrorKind::ConnectionRefused))
            .unwrap();
        assert_eq!(stats.snapshot().rebinds, 0);

        reflector
            .handle_error(io::Error::from_raw_os_error(libc::EBADF))
            .unwrap();
        let err = reflector
            .handle_error(io::Error::from_raw_os_error(libc::EBADF))
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        assert_eq!(stats.snapshot().rebinds, 1);
    }

    #[test]
    fn test_error_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EHOSTUNREACH)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(is_timeout(&io::Error::from(io::ErrorKind::WouldBlock)));
    }
}
