//! Telemetry store errors

use std::io;

/// Errors raised while attaching to or operating on the shared table
#[derive(Debug)]
pub enum TelemetryError {
    /// Operation on a handle that is not attached
    NotAttached,
    /// File, mapping or advisory-lock failure
    Io { op: &'static str, source: io::Error },
    /// pthread call returned an error code
    Lock { op: &'static str, code: i32 },
    /// Existing backing object has the wrong size (layout mismatch)
    SizeMismatch { expected: u64, found: u64 },
}

impl TelemetryError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }
}

impl std::fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAttached => write!(f, "telemetry table not attached"),
            Self::Io { op, source } => write!(f, "{} failed: {}", op, source),
            Self::Lock { op, code } => {
                write!(f, "{} failed: {}", op, io::Error::from_raw_os_error(*code))
            }
            Self::SizeMismatch { expected, found } => write!(
                f,
                "telemetry table size mismatch: {} bytes (expected {})",
                found, expected
            ),
        }
    }
}

impl std::error::Error for TelemetryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
