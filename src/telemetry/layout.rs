//! Shared table layout
//!
//! Binary-compatible with the C definition compiled into the routing daemon:
//!
//! ```text
//! struct twamp_nexthop {            struct twamp_shm {
//!     struct in_addr addr;              pthread_mutex_t lock;
//!     uint32_t latency_ms;              uint32_t nh_count;
//!     uint8_t active;                   uint32_t sequence;
//!     uint8_t measured;                 uint32_t padding;
//!     uint8_t padding[2];               struct twamp_nexthop nexthops[1024];
//!     time_t last_updated;          };
//! };
//! ```
//!
//! The Rust side splits `twamp_shm` into the lock and the `NexthopTable` body
//! so the mutex is never reachable through a Rust reference. `repr(C)` gives
//! the body an 8-byte alignment, which reproduces the C offsets exactly.

use std::net::Ipv4Addr;

/// Fixed number of slots; soft-deleted slots are not reused
pub const MAX_NEXTHOPS: usize = 1024;

/// Latency value meaning "not measured"
pub const LATENCY_UNMEASURED: u32 = u32::MAX;

/// Backing object used by the routing daemon (`shm_open("/bgp_twamp_shm")`)
pub const DEFAULT_SHM_PATH: &str = "/dev/shm/bgp_twamp_shm";

/// One monitored next-hop (24 bytes on LP64)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct NexthopEntry {
    /// IPv4 address, network byte order
    pub addr: u32,
    pub latency_ms: u32,
    pub active: u8,
    pub measured: u8,
    pub padding: [u8; 2],
    /// Seconds since the Unix epoch, 0 = never measured
    pub last_updated: libc::time_t,
}

impl NexthopEntry {
    /// Fresh slot: active, unmeasured
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            addr: encode_addr(address),
            latency_ms: LATENCY_UNMEASURED,
            active: 1,
            measured: 0,
            padding: [0; 2],
            last_updated: 0,
        }
    }

    #[inline]
    pub fn address(&self) -> Ipv4Addr {
        decode_addr(self.addr)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active != 0
    }

    #[inline]
    pub fn is_measured(&self) -> bool {
        self.measured != 0
    }
}

/// Counters and slots guarded by the shared lock
#[derive(Debug)]
#[repr(C)]
pub struct NexthopTable {
    pub nh_count: u32,
    pub sequence: u32,
    pub padding: u32,
    pub nexthops: [NexthopEntry; MAX_NEXTHOPS],
}

/// Whole mapped region
#[repr(C)]
pub struct SharedTable {
    pub lock: libc::pthread_mutex_t,
    pub table: NexthopTable,
}

/// Size of the mapped region in bytes
pub const SHARED_TABLE_SIZE: usize = std::mem::size_of::<SharedTable>();

// Pin the layout the routing daemon was compiled against.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const _: () = {
    assert!(std::mem::size_of::<NexthopEntry>() == 24);
    assert!(std::mem::size_of::<libc::pthread_mutex_t>() == 40);
    assert!(std::mem::size_of::<NexthopTable>() == 16 + 24 * MAX_NEXTHOPS);
    assert!(SHARED_TABLE_SIZE == 56 + 24 * MAX_NEXTHOPS);
};

/// `struct in_addr` stores the octets in memory order
#[inline]
pub fn encode_addr(address: Ipv4Addr) -> u32 {
    u32::from_ne_bytes(address.octets())
}

#[inline]
pub fn decode_addr(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_ne_bytes())
}
