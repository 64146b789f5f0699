//! Routing-side consumers of the telemetry table

pub mod hooks;
pub mod monitor;

pub use hooks::{LatencyImport, LatencyImportConfig, PeerInfo, PeerKind, PeerSource};
pub use monitor::{ChangeMonitor, MonitorHandle, SequenceChange, SequenceWatch, DEFAULT_CHECK_INTERVAL};
