//! Runtime configuration for the GATT client
//!
//! Defaults cover the common case. A deployment can override them from a
//! TOML/JSON file and `GATTKIT_*` environment variables (feature `config-file`),
//! or from an inline JSON document.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    DEFAULT_CHARACTERISTIC_LOOKUP_MS, DEFAULT_DISCONNECT_TIMEOUT_MS, DEFAULT_DISCOVERY_TIMEOUT_MS,
    DEFAULT_OPERATION_TIMEOUT_MS, DEFAULT_RECONNECT_SETTLE_MS,
};

/// Which operations share one in-flight slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// One operation in flight across every device (single radio context)
    #[default]
    Global,
    /// One operation in flight per device (host supports parallel links)
    PerDevice,
}

/// GATT client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Bound on each in-flight read/write/notify toggle
    pub operation_timeout_ms: u64,
    /// How long a characteristic may take to show up after discovery
    pub characteristic_lookup_ms: u64,
    /// Bound on service discovery during connect (None for unbounded)
    pub discovery_timeout_ms: Option<u64>,
    /// Delay between reconnecting and re-discovering services
    pub reconnect_settle_ms: u64,
    /// Bound on waiting for the host to confirm a disconnect
    pub disconnect_timeout_ms: u64,
    /// Operation serialization policy
    pub gate_policy: GatePolicy,
    /// Per-characteristic notification buffer
    pub notification_buffer: usize,
    /// Scan sighting buffer shared by all scan streams
    pub scan_buffer: usize,
    /// Connection-state event buffer
    pub state_buffer: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            characteristic_lookup_ms: DEFAULT_CHARACTERISTIC_LOOKUP_MS,
            discovery_timeout_ms: Some(DEFAULT_DISCOVERY_TIMEOUT_MS),
            reconnect_settle_ms: DEFAULT_RECONNECT_SETTLE_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            gate_policy: GatePolicy::Global,
            notification_buffer: 64,
            scan_buffer: 256,
            state_buffer: 64,
        }
    }
}

impl BleConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn characteristic_lookup(&self) -> Duration {
        Duration::from_millis(self.characteristic_lookup_ms)
    }

    pub fn discovery_timeout(&self) -> Option<Duration> {
        self.discovery_timeout_ms.map(Duration::from_millis)
    }

    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Reject settings that would make operations fail instantly or drop
    /// every event
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("operation_timeout_ms", self.operation_timeout_ms),
            ("disconnect_timeout_ms", self.disconnect_timeout_ms),
            (
                "discovery_timeout_ms",
                self.discovery_timeout_ms.unwrap_or(u64::MAX),
            ),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        let buffers = [
            ("notification_buffer", self.notification_buffer),
            ("scan_buffer", self.scan_buffer),
            ("state_buffer", self.state_buffer),
        ];
        for (name, value) in buffers {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// Parse and validate a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file layered under `GATTKIT_*` environment
    /// variables, e.g. `GATTKIT_OPERATION_TIMEOUT_MS=5000`
    #[cfg(feature = "config-file")]
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("GATTKIT").try_parsing(true))
            .build()?;
        let loaded: Self = settings.try_deserialize()?;
        loaded.validate()?;
        tracing::debug!("Loaded BLE configuration: {:?}", loaded);
        Ok(loaded)
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration source error: {0}")]
    Source(String),

    #[error("Configuration parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(feature = "config-file")]
impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Source(err.to_string())
    }
}
