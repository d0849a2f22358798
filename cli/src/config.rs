// Configuration management for the blebridge CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/blebridge/config.json
// - Linux: ~/.config/blebridge/config.json
// - Windows: %APPDATA%\blebridge\config.json

use anyhow::{Context, Result};
use blebridge_core::{BridgeConfig, DuplicatePolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Settings handed to the bridge core
    pub bridge: BridgeConfig,

    /// Simulated radio behaviour
    pub simulator: SimulatorConfig,

    /// Directory for rolling log files; console only when unset
    pub log_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Number of simulated heart-rate monitors
    pub devices: usize,

    /// Advertising interval in milliseconds
    pub advertising_interval_ms: u64,

    /// Delay before each simulated platform callback, in milliseconds
    pub callback_latency_ms: u64,

    /// Chance (0.0 - 1.0) that a connect attempt fails with GATT_ERROR
    pub connect_failure_rate: f64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            simulator: SimulatorConfig::default(),
            log_dir: None,
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            devices: 3,
            advertising_interval_ms: 500,
            callback_latency_ms: 40,
            connect_failure_rate: 0.1,
        }
    }
}

impl CliConfig {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("blebridge");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: CliConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config
            .bridge
            .validate()
            .context("Invalid bridge settings in config file")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Set a config value by key; the result is validated before it is kept
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        match key {
            "connect_timeout_ms" => {
                updated.bridge.connect_timeout_ms = value.parse().context("Invalid number")?;
            }
            "discovery_timeout_ms" => {
                updated.bridge.discovery_timeout_ms = value.parse().context("Invalid number")?;
            }
            "disconnect_timeout_ms" => {
                updated.bridge.disconnect_timeout_ms = value.parse().context("Invalid number")?;
            }
            "operation_timeout_ms" => {
                updated.bridge.operation_timeout_ms = value.parse().context("Invalid number")?;
            }
            "max_queued_operations" => {
                updated.bridge.max_queued_operations = value.parse().context("Invalid number")?;
            }
            "registry_capacity" => {
                updated.bridge.registry_capacity = value.parse().context("Invalid number")?;
            }
            "duplicate_policy" => {
                updated.bridge.duplicate_policy = parse_policy(value)?;
            }
            "devices" => {
                updated.simulator.devices = value.parse().context("Invalid number")?;
            }
            "advertising_interval_ms" => {
                updated.simulator.advertising_interval_ms =
                    value.parse().context("Invalid number")?;
            }
            "callback_latency_ms" => {
                updated.simulator.callback_latency_ms = value.parse().context("Invalid number")?;
            }
            "connect_failure_rate" => {
                let rate: f64 = value.parse().context("Invalid rate")?;
                if !(0.0..=1.0).contains(&rate) {
                    anyhow::bail!("connect_failure_rate must be between 0.0 and 1.0");
                }
                updated.simulator.connect_failure_rate = rate;
            }
            "log_dir" => {
                updated.log_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        updated
            .bridge
            .validate()
            .with_context(|| format!("Rejected value for {}", key))?;
        *self = updated;
        Ok(())
    }

    /// All config values as displayable pairs
    pub fn list(&self) -> Vec<(String, String)> {
        let bridge = &self.bridge;
        let sim = &self.simulator;
        vec![
            ("connect_timeout_ms".to_string(), bridge.connect_timeout_ms.to_string()),
            ("discovery_timeout_ms".to_string(), bridge.discovery_timeout_ms.to_string()),
            ("disconnect_timeout_ms".to_string(), bridge.disconnect_timeout_ms.to_string()),
            ("operation_timeout_ms".to_string(), bridge.operation_timeout_ms.to_string()),
            ("max_queued_operations".to_string(), bridge.max_queued_operations.to_string()),
            ("registry_capacity".to_string(), bridge.registry_capacity.to_string()),
            ("duplicate_policy".to_string(), format!("{:?}", bridge.duplicate_policy)),
            ("devices".to_string(), sim.devices.to_string()),
            ("advertising_interval_ms".to_string(), sim.advertising_interval_ms.to_string()),
            ("callback_latency_ms".to_string(), sim.callback_latency_ms.to_string()),
            ("connect_failure_rate".to_string(), sim.connect_failure_rate.to_string()),
            (
                "log_dir".to_string(),
                self.log_dir.clone().unwrap_or_else(|| "(console only)".to_string()),
            ),
        ]
    }
}

fn parse_policy(value: &str) -> Result<DuplicatePolicy> {
    match value.to_lowercase().replace('-', "_").as_str() {
        "all" => Ok(DuplicatePolicy::All),
        "first_seen_only" | "first" => Ok(DuplicatePolicy::FirstSeenOnly),
        other => anyhow::bail!("Unknown duplicate policy: {} (all | first_seen_only)", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CliConfig::default();
        assert!(config.bridge.validate().is_ok());
        assert_eq!(config.simulator.devices, 3);
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("config.json");

        let mut config = CliConfig::default();
        config.set("operation_timeout_ms", "2500").expect("set");
        config.set("duplicate_policy", "all").expect("set");
        config.save_to(&path).expect("Failed to save");

        let loaded = CliConfig::load_from(&path).expect("Failed to load");
        assert_eq!(loaded, config);
        assert_eq!(loaded.bridge.operation_timeout_ms, 2500);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let loaded = CliConfig::load_from(&dir.path().join("absent.json")).expect("load");
        assert_eq!(loaded, CliConfig::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"bridge": {"connect_timeout_ms": 1500}}"#).expect("write");

        let loaded = CliConfig::load_from(&path).expect("load");
        assert_eq!(loaded.bridge.connect_timeout_ms, 1500);
        assert_eq!(loaded.bridge.operation_timeout_ms, 30_000);
        assert_eq!(loaded.simulator, SimulatorConfig::default());
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = CliConfig::default();
        assert!(config.set("connect_timeout_ms", "0").is_err());
        assert!(config.set("connect_timeout_ms", "soon").is_err());
        assert!(config.set("connect_failure_rate", "1.5").is_err());
        assert!(config.set("no_such_key", "1").is_err());
        // Rejected values leave the config untouched
        assert_eq!(config, CliConfig::default());
    }
}
