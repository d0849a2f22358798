// Bridge configuration
//
// Every field has a bounded default; hosts usually deserialize a partial JSON
// object and let the rest fall back.

use crate::types::DuplicatePolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Upper bound for every `*_timeout_ms` field (one day)
pub const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Connect attempt deadline in milliseconds
    pub connect_timeout_ms: u64,

    /// Service discovery deadline in milliseconds
    pub discovery_timeout_ms: u64,

    /// How long to wait for the platform to confirm a requested disconnect
    pub disconnect_timeout_ms: u64,

    /// Per-operation deadline for reads, writes and notify toggles
    pub operation_timeout_ms: u64,

    /// Backpressure bound: in-flight plus queued operations per device
    pub max_queued_operations: usize,

    /// Maximum number of peripherals remembered by the registry
    pub registry_capacity: usize,

    /// Used when a scan request does not name a policy
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            discovery_timeout_ms: 5_000,
            disconnect_timeout_ms: 5_000,
            operation_timeout_ms: 30_000,
            max_queued_operations: 16,
            registry_capacity: 256,
            duplicate_policy: DuplicatePolicy::FirstSeenOnly,
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("discovery_timeout_ms", self.discovery_timeout_ms),
            ("disconnect_timeout_ms", self.disconnect_timeout_ms),
            ("operation_timeout_ms", self.operation_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be > 0", name)));
            }
            if value > MAX_TIMEOUT_MS {
                return Err(ConfigError::Invalid(format!(
                    "{} must be <= {}",
                    name, MAX_TIMEOUT_MS
                )));
            }
        }
        if self.max_queued_operations == 0 {
            return Err(ConfigError::Invalid(
                "max_queued_operations must be > 0".to_string(),
            ));
        }
        if self.registry_capacity == 0 {
            return Err(ConfigError::Invalid(
                "registry_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.discovery_timeout(), Duration::from_secs(5));
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = BridgeConfig {
            operation_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid("operation_timeout_ms must be > 0".into()))
        );
    }

    #[test]
    fn test_huge_timeout_rejected() {
        let config = BridgeConfig {
            connect_timeout_ms: u64::MAX,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid(format!(
                "connect_timeout_ms must be <= {}",
                MAX_TIMEOUT_MS
            )))
        );

        let at_limit = BridgeConfig {
            operation_timeout_ms: MAX_TIMEOUT_MS,
            ..Default::default()
        };
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn test_zero_queue_bound_rejected() {
        let config = BridgeConfig {
            max_queued_operations: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config = BridgeConfig::from_json(r#"{ "connect_timeout_ms": 2500, "duplicate_policy": "all" }"#)
            .expect("valid config");
        assert_eq!(config.connect_timeout_ms, 2500);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::All);
        assert_eq!(config.max_queued_operations, 16);
    }

    #[test]
    fn test_malformed_json() {
        let result = BridgeConfig::from_json("{ not json");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
