//! Measurement agent configuration
//!
//! Loaded from TOML; every field has a default so a partial file (or none at
//! all) works. Durations are written in milliseconds.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::reflector::ReflectorConfig;
use super::sender::ProberConfig;
use super::wire::TWAMP_PORT;
use crate::telemetry::DEFAULT_SHM_PATH;

/// Upper bound on probes per target per cycle
pub const MAX_PACKET_COUNT: u32 = 100;

/// How successful RTT samples of one cycle collapse into one latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPolicy {
    /// Smallest RTT of the cycle
    #[default]
    Min,
    Mean,
    Median,
}

impl AggregationPolicy {
    /// None when there are no samples
    pub fn aggregate(&self, samples: &[Duration]) -> Option<Duration> {
        if samples.is_empty() {
            return None;
        }

        match self {
            Self::Min => samples.iter().min().copied(),
            Self::Mean => {
                let total: Duration = samples.iter().sum();
                Some(total / samples.len() as u32)
            }
            Self::Median => {
                let mut sorted = samples.to_vec();
                sorted.sort_unstable();
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Some((sorted[mid - 1] + sorted[mid]) / 2)
                } else {
                    Some(sorted[mid])
                }
            }
        }
    }
}

impl std::str::FromStr for AggregationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "min" => Ok(Self::Min),
            "mean" | "avg" => Ok(Self::Mean),
            "median" => Ok(Self::Median),
            other => Err(format!("unknown aggregation policy: {}", other)),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Backing object of the shared table
    pub shm_path: PathBuf,
    /// UDP port probed on every target and served by the reflector
    pub port: u16,
    /// Reflector bind address
    pub bind_addr: Ipv4Addr,
    /// Probes per target per cycle
    pub packet_count: u32,
    /// Gap between probes to the same target
    #[serde(with = "duration_serde")]
    pub probe_interval: Duration,
    /// Wait for one reply
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,
    /// Pause between full cycles
    #[serde(with = "duration_serde")]
    pub probe_cycle: Duration,
    /// Re-check interval while there is nothing to probe
    #[serde(with = "duration_serde")]
    pub idle_wait: Duration,
    /// How often the table is polled for new next-hops
    #[serde(with = "duration_serde")]
    pub discovery_interval: Duration,
    /// Reflector receive timeout
    #[serde(with = "duration_serde")]
    pub reflector_poll: Duration,
    pub aggregation: AggregationPolicy,
    /// Mark a target unmeasured after this many all-timeout cycles
    pub expire_after_failed_cycles: Option<u32>,
    pub reflector_enabled: bool,
    pub sender_enabled: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            shm_path: PathBuf::from(DEFAULT_SHM_PATH),
            port: TWAMP_PORT,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            packet_count: 3,
            probe_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(100),
            probe_cycle: Duration::from_secs(60),
            idle_wait: Duration::from_secs(1),
            discovery_interval: Duration::from_secs(1),
            reflector_poll: Duration::from_secs(1),
            aggregation: AggregationPolicy::Min,
            expire_after_failed_cycles: None,
            reflector_enabled: true,
            sender_enabled: true,
        }
    }
}

/// Rejected configuration value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    PacketCount(u32),
    ZeroDuration(&'static str),
    ZeroPort,
    ZeroExpiry,
    NothingEnabled,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PacketCount(n) => write!(
                f,
                "packet count must be between 1 and {} (got {})",
                MAX_PACKET_COUNT, n
            ),
            Self::ZeroDuration(field) => write!(f, "{} must be greater than zero", field),
            Self::ZeroPort => write!(f, "port must be non-zero"),
            Self::ZeroExpiry => write!(f, "expire_after_failed_cycles must be at least 1"),
            Self::NothingEnabled => write!(f, "both reflector and sender are disabled"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl AgentConfig {
    /// Read a TOML file; missing keys take their defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_count == 0 || self.packet_count > MAX_PACKET_COUNT {
            return Err(ConfigError::PacketCount(self.packet_count));
        }
        for (field, value) in [
            ("probe_timeout", self.probe_timeout),
            ("probe_cycle", self.probe_cycle),
            ("idle_wait", self.idle_wait),
            ("discovery_interval", self.discovery_interval),
            ("reflector_poll", self.reflector_poll),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(field));
            }
        }
        // Port 0 lets a local reflector pick one; the sender then follows it
        if self.port == 0 && !self.reflector_enabled {
            return Err(ConfigError::ZeroPort);
        }
        if self.expire_after_failed_cycles == Some(0) {
            return Err(ConfigError::ZeroExpiry);
        }
        if !self.reflector_enabled && !self.sender_enabled {
            return Err(ConfigError::NothingEnabled);
        }
        Ok(())
    }

    pub fn reflector_config(&self) -> ReflectorConfig {
        ReflectorConfig {
            bind_addr: SocketAddr::from((self.bind_addr, self.port)),
            poll_interval: self.reflector_poll,
        }
    }

    pub fn prober_config(&self) -> ProberConfig {
        ProberConfig {
            port: self.port,
            packet_count: self.packet_count,
            probe_interval: self.probe_interval,
            probe_timeout: self.probe_timeout,
            cycle_interval: self.probe_cycle,
            idle_wait: self.idle_wait,
            aggregation: self.aggregation,
            expire_after_failed_cycles: self.expire_after_failed_cycles,
        }
    }
}

// Durations as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_defaults_match_daemon() {
        let config = AgentConfig::default();
        assert_eq!(config.port, 862);
        assert_eq!(config.packet_count, 3);
        assert_eq!(config.probe_interval, ms(10));
        assert_eq!(config.probe_timeout, ms(100));
        assert_eq!(config.probe_cycle, Duration::from_secs(60));
        assert_eq!(config.aggregation, AggregationPolicy::Min);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            packet_count = 5
            probe_timeout = 250
            aggregation = "median"
            expire_after_failed_cycles = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.packet_count, 5);
        assert_eq!(config.probe_timeout, ms(250));
        assert_eq!(config.aggregation, AggregationPolicy::Median);
        assert_eq!(config.expire_after_failed_cycles, Some(3));
        assert_eq!(config.probe_cycle, Duration::from_secs(60));
        assert_eq!(config.shm_path, PathBuf::from(DEFAULT_SHM_PATH));
    }

    #[test]
    fn test_validate_packet_count_bounds() {
        let mut config = AgentConfig::default();
        config.packet_count = 0;
        assert_eq!(config.validate(), Err(ConfigError::PacketCount(0)));
        config.packet_count = 101;
        assert_eq!(config.validate(), Err(ConfigError::PacketCount(101)));
        config.packet_count = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = AgentConfig::default();
        config.probe_timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroDuration("probe_timeout")));

        let mut config = AgentConfig::default();
        config.probe_cycle = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroDuration("probe_cycle")));

        let mut config = AgentConfig::default();
        config.port = 0;
        assert!(config.validate().is_ok());
        config.reflector_enabled = false;
        assert_eq!(config.validate(), Err(ConfigError::ZeroPort));
    }

    #[test]
    fn test_aggregation_policies() {
        let samples = [ms(8), ms(2), ms(6), ms(4)];

        assert_eq!(AggregationPolicy::Min.aggregate(&samples), Some(ms(2)));
        assert_eq!(AggregationPolicy::Mean.aggregate(&samples), Some(ms(5)));
        assert_eq!(AggregationPolicy::Median.aggregate(&samples), Some(ms(5)));
        assert_eq!(AggregationPolicy::Median.aggregate(&samples[..3]), Some(ms(6)));
        assert_eq!(AggregationPolicy::Min.aggregate(&[]), None);
    }

    #[test]
    fn test_aggregation_from_str() {
        assert_eq!("MEDIAN".parse(), Ok(AggregationPolicy::Median));
        assert_eq!("avg".parse(), Ok(AggregationPolicy::Mean));
        assert!("max".parse::<AggregationPolicy>().is_err());
    }
}
