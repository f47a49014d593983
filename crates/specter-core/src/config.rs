use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::message::Protocol;

/// What to do when a lane's input queue is full.
///
/// Stale events are less useful than fresh ones, so the default sheds
/// the oldest entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    DropOldest,
    DropNewest,
}

/// Analyzer configuration. Every field has a default; a config file only
/// needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerConfig {
    /// Worker lane count. `0` means one lane per available CPU.
    pub workers: usize,

    #[serde(rename = "connection_idle_ttl_ms", with = "duration_ms")]
    pub connection_idle_ttl: Duration,
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(rename = "eviction_interval_ms", with = "duration_ms")]
    pub eviction_interval: Duration,
    /// How long lanes may keep draining their input after a shutdown
    /// signal before dropping what remains.
    #[serde(rename = "drain_timeout_ms", with = "duration_ms")]
    pub drain_timeout: Duration,

    pub max_connections: usize,
    pub max_pending_per_connection: usize,
    pub max_partial_buffer: usize,
    pub lane_queue_depth: usize,
    pub identification_max_retries: u32,
    pub drop_policy: DropPolicy,

    /// Server port → decoder candidates, tried in order. Ports not
    /// listed here get the full default candidate order.
    pub port_protocol_map: HashMap<u16, Vec<Protocol>>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            connection_idle_ttl: Duration::from_secs(120),
            request_timeout: Duration::from_secs(60),
            eviction_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(2),
            max_connections: 100_000,
            max_pending_per_connection: 16,
            max_partial_buffer: 1024 * 1024,
            lane_queue_depth: 8192,
            identification_max_retries: 5,
            drop_policy: DropPolicy::DropOldest,
            port_protocol_map: default_port_map(),
        }
    }
}

/// Well-known server ports. Overridable via `port_protocol_map`.
pub fn default_port_map() -> HashMap<u16, Vec<Protocol>> {
    HashMap::from([
        (80, vec![Protocol::Http]),
        (8000, vec![Protocol::Http]),
        (8080, vec![Protocol::Http]),
        (3306, vec![Protocol::Mysql]),
        (6379, vec![Protocol::Redis]),
        (53, vec![Protocol::Dns]),
        (9092, vec![Protocol::Kafka]),
        (20880, vec![Protocol::Dubbo]),
        (9876, vec![Protocol::Rocketmq]),
        (10911, vec![Protocol::Rocketmq]),
    ])
}

impl AnalyzerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be > 0".into()));
        }
        if self.max_pending_per_connection == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_per_connection must be > 0".into(),
            ));
        }
        if self.max_partial_buffer == 0 {
            return Err(ConfigError::Invalid(
                "max_partial_buffer must be > 0".into(),
            ));
        }
        if self.lane_queue_depth == 0 {
            return Err(ConfigError::Invalid("lane_queue_depth must be > 0".into()));
        }
        if self.eviction_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "eviction_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Lane count after resolving `workers == 0` to the CPU count.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
