//! Measurement agent
//!
//! TWAMP-light reflector and sender that keep the shared table's latencies
//! current:
//! - `discovery` mirrors the table's active next-hops into a `TargetSet`
//! - `sender` probes every target once per cycle and records the result
//! - `reflector` answers probes arriving from peers

pub mod config;
pub mod discovery;
pub mod reflector;
pub mod runtime;
pub mod sender;
pub mod targets;
pub mod wire;

pub use config::{AgentConfig, AggregationPolicy, ConfigError};
pub use reflector::{Reflector, ReflectorConfig, ReflectorStatsSnapshot};
pub use runtime::{Agent, AgentStatus};
pub use sender::{CycleReport, Prober, ProberConfig, ProberStatsSnapshot};
pub use targets::TargetSet;
pub use wire::{ProbeKind, ProbePacket, ProbeWireError, TWAMP_PORT};
