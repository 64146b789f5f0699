//! Probe wire format
//!
//! Fixed 36-byte TWAMP-light test packet, all fields big-endian:
//!
//! ```text
//! Offset  Size  Field
//! 0       2     magic (0x7A4D)
//! 2       1     version
//! 3       1     kind (1 = request, 2 = reply)
//! 4       4     sequence
//! 8       8     sender_ts_ns (sender clock)
//! 16      8     reflector_rx_ns (reflector clock)
//! 24      8     reflector_tx_ns (reflector clock)
//! 32      4     checksum (CRC32 over bytes 0..32)
//! Total: 36 bytes
//! ```
//!
//! The two clocks are never compared with each other: the reflector only
//! contributes its own residence time (tx - rx).

use std::time::Duration;

/// Well-known TWAMP port
pub const TWAMP_PORT: u16 = 862;

/// Magic bytes: 0x7A4D ("zM", twamp-light)
pub const PROBE_MAGIC: u16 = 0x7A4D;

/// Current protocol version
pub const PROBE_VERSION: u8 = 1;

/// Total packet size in bytes
pub const PROBE_PACKET_SIZE: usize = 36;

const CHECKSUM_OFFSET: usize = PROBE_PACKET_SIZE - 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeKind {
    Request = 1,
    Reply = 2,
}

impl ProbeKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Request),
            2 => Some(Self::Reply),
            _ => None,
        }
    }
}

/// Decoded probe packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePacket {
    pub kind: ProbeKind,
    pub seq: u32,
    pub sender_ts_ns: u64,
    pub reflector_rx_ns: u64,
    pub reflector_tx_ns: u64,
}

impl ProbePacket {
    /// Outgoing request stamped with the sender clock
    pub fn request(seq: u32, sender_ts_ns: u64) -> Self {
        Self {
            kind: ProbeKind::Request,
            seq,
            sender_ts_ns,
            reflector_rx_ns: 0,
            reflector_tx_ns: 0,
        }
    }

    /// Reply to `self`, echoing sequence and sender timestamp
    pub fn reply(&self, reflector_rx_ns: u64, reflector_tx_ns: u64) -> Self {
        Self {
            kind: ProbeKind::Reply,
            seq: self.seq,
            sender_ts_ns: self.sender_ts_ns,
            reflector_rx_ns,
            reflector_tx_ns,
        }
    }

    /// Time spent inside the reflector
    #[inline]
    pub fn reflector_residence_ns(&self) -> u64 {
        self.reflector_tx_ns.saturating_sub(self.reflector_rx_ns)
    }

    /// Round trip for a reply received at `recv_ns` on the sender clock.
    ///
    /// Clamped at zero when the reflector reports more residence than the
    /// whole exchange took.
    pub fn round_trip(&self, recv_ns: u64) -> Duration {
        let total = recv_ns.saturating_sub(self.sender_ts_ns);
        Duration::from_nanos(total.saturating_sub(self.reflector_residence_ns()))
    }

    pub fn to_bytes(&self) -> [u8; PROBE_PACKET_SIZE] {
        let mut buf = [0u8; PROBE_PACKET_SIZE];
        buf[0..2].copy_from_slice(&PROBE_MAGIC.to_be_bytes());
        buf[2] = PROBE_VERSION;
        buf[3] = self.kind as u8;
        buf[4..8].copy_from_slice(&self.seq.to_be_bytes());
        buf[8..16].copy_from_slice(&self.sender_ts_ns.to_be_bytes());
        buf[16..24].copy_from_slice(&self.reflector_rx_ns.to_be_bytes());
        buf[24..32].copy_from_slice(&self.reflector_tx_ns.to_be_bytes());
        let checksum = crc32_fast(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// Parse and validate a datagram; trailing bytes past 36 are ignored
    pub fn try_from_slice(buf: &[u8]) -> Result<Self, ProbeWireError> {
        if buf.len() < PROBE_PACKET_SIZE {
            return Err(ProbeWireError::InvalidSize(buf.len()));
        }

        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != PROBE_MAGIC {
            return Err(ProbeWireError::InvalidMagic(magic));
        }

        if buf[2] != PROBE_VERSION {
            return Err(ProbeWireError::UnsupportedVersion(buf[2]));
        }

        let checksum = read_u32(buf, CHECKSUM_OFFSET);
        if checksum != crc32_fast(&buf[..CHECKSUM_OFFSET]) {
            return Err(ProbeWireError::ChecksumMismatch);
        }

        let kind = ProbeKind::from_u8(buf[3]).ok_or(ProbeWireError::UnknownKind(buf[3]))?;

        Ok(Self {
            kind,
            seq: read_u32(buf, 4),
            sender_ts_ns: read_u64(buf, 8),
            reflector_rx_ns: read_u64(buf, 16),
            reflector_tx_ns: read_u64(buf, 24),
        })
    }
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(raw)
}

#[inline]
fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Errors during probe parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeWireError {
    InvalidSize(usize),
    InvalidMagic(u16),
    UnsupportedVersion(u8),
    UnknownKind(u8),
    ChecksumMismatch,
}

impl std::fmt::Display for ProbeWireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize(s) => {
                write!(f, "short probe: {} bytes (expected {})", s, PROBE_PACKET_SIZE)
            }
            Self::InvalidMagic(m) => {
                write!(f, "invalid magic: 0x{:04X} (expected 0x{:04X})", m, PROBE_MAGIC)
            }
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported version: {} (expected {})", v, PROBE_VERSION)
            }
            Self::UnknownKind(k) => write!(f, "unknown packet kind: {}", k),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
        }
    }
}

impl std::error::Error for ProbeWireError {}

/// CRC32 (IEEE polynomial), table built at compile time
fn crc32_fast(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = crc32_table();

    let mut crc = !0u32;
    for &byte in data {
        crc = TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { 0xEDB8_8320 ^ (crc >> 1) } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}
