//! Telemetry Store
//!
//! Fixed-capacity table of per-next-hop measurement state, mapped by both the
//! routing daemon and the measurement agent, guarded by one process-shared
//! mutex and a change-sequence counter.

pub mod error;
pub mod layout;
mod lock;
mod region;
pub mod store;
pub mod table;

pub use error::TelemetryError;
pub use layout::{NexthopEntry, DEFAULT_SHM_PATH, LATENCY_UNMEASURED, MAX_NEXTHOPS};
pub use store::{NexthopRecord, StoreState, TableSnapshot, TelemetryStore};
pub use table::AddOutcome;
