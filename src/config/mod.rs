//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;

pub use messaging::{ChannelConfig, MessagingConfig, MessagingType};
pub use storage::{SqliteConfig, StorageConfig, StorageType};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CAISSON_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CAISSON";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CAISSON_LOG";

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Messaging configuration.
    pub messaging: MessagingConfig,
    /// Orphan sweep configuration.
    pub sweep: SweepConfig,
}

impl Config {
    /// Load configuration from the default file (or `CAISSON_CONFIG`)
    /// layered under `CAISSON__`-prefixed environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(&path)
    }

    /// Load configuration from a specific file path, environment
    /// overrides applied on top. The file may be absent.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

/// Orphan sweep configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Enable the background orphan sweep. Default: false.
    pub enabled: bool,
    /// Minimum age in seconds before an orphaned pending row may be
    /// removed. Default: 3600.
    pub grace_secs: u64,
    /// Interval in seconds between sweeps. Default: 300.
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            grace_secs: 3600,
            interval_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.storage.storage_type, StorageType::default());
        assert!(!config.sweep.enabled);
        assert_eq!(config.sweep.grace_secs, 3600);
        assert_eq!(config.sweep.interval_secs, 300);
    }

    #[test]
    fn test_load_from_missing_file_yields_defaults() {
        let config = Config::load_from("definitely/not/here.yaml").unwrap();
        assert!(!config.sweep.enabled);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "storage:\n  type: memory\nsweep:\n  enabled: true\n  grace_secs: 60"
        )
        .unwrap();

        let config = Config::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.storage.storage_type, StorageType::Memory);
        assert!(config.sweep.enabled);
        assert_eq!(config.sweep.grace_secs, 60);
        // Unset keys keep their defaults.
        assert_eq!(config.sweep.interval_secs, 300);
    }
}
