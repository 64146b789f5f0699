//! Next-hop Latency Telemetry
//!
//! A TWAMP-light measurement agent publishes round-trip latency of monitored
//! IPv4 next-hops into a table shared with the routing daemon, which re-runs
//! path selection when the table changes.
//!
//! - `telemetry`: the cross-process table and its registry operations
//! - `agent`: reflector and sender/prober roles of the measurement agent
//! - `routing`: change monitor and the hooks the routing daemon calls
//! - `shutdown`: cooperative cancellation shared by every long-running loop

pub mod agent;
pub mod routing;
pub mod shutdown;
pub mod telemetry;

pub use shutdown::ShutdownSignal;
pub use telemetry::{TelemetryError, TelemetryStore, LATENCY_UNMEASURED};
