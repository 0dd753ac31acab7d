// Port and transport configuration
//
// All durations are stored as milliseconds so the JSON file stays readable.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Longest status sentence the input pipe must be able to hold in one piece
pub const MIN_INPUT_BUFFER_SIZE: usize = 128;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Buffer sizes and timeouts of a memory port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// How long a write may block on a full buffer before giving up (default 5000ms)
    pub write_timeout_ms: u64,
    /// Capacity of the pipe feeding the driver (default 2048)
    pub input_buffer_size: usize,
    /// Capacity of the pipe carrying driver bytes to the transport (default 4096)
    pub receive_buffer_size: usize,
    /// Staging capacity of each output worker (default 4096)
    pub output_buffer_size: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 5000,
            input_buffer_size: 2048,
            receive_buffer_size: 4096,
            output_buffer_size: 4096,
        }
    }
}

impl PortConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "write_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.input_buffer_size < MIN_INPUT_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "input_buffer_size must be >= {}",
                MIN_INPUT_BUFFER_SIZE
            )));
        }
        if self.receive_buffer_size == 0 || self.output_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "Buffer sizes must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// BLE scan and connection timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// How long a discovery scan runs before it is stopped (default 10s)
    pub scan_duration_ms: u64,
    /// Upper bound on waiting for the connect worker during close (default 2s)
    pub connect_join_timeout_ms: u64,
    /// A pending identity read is skipped after this long (default 5s)
    pub attribute_read_timeout_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_duration_ms: 10_000,
            connect_join_timeout_ms: 2_000,
            attribute_read_timeout_ms: 5_000,
        }
    }
}

impl BleConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn connect_join_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_join_timeout_ms)
    }

    pub fn attribute_read_timeout(&self) -> Duration {
        Duration::from_millis(self.attribute_read_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_duration_ms == 0
            || self.connect_join_timeout_ms == 0
            || self.attribute_read_timeout_ms == 0
        {
            return Err(ConfigError::Invalid(
                "BLE timeouts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete configuration handed to ports through a `BleContext`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: PortConfig,
    pub ble: BleConfig,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.port.validate()?;
        self.ble.validate()
    }

    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port.write_timeout_ms, 5000);
        assert_eq!(config.port.input_buffer_size, 2048);
        assert_eq!(config.ble.scan_duration_ms, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"ble":{"scan_duration_ms":3000}}"#).expect("Parse");
        assert_eq!(config.ble.scan_duration(), Duration::from_secs(3));
        assert_eq!(config.ble.attribute_read_timeout_ms, 5_000);
        assert_eq!(config.port, PortConfig::default());
    }

    #[test]
    fn test_validation_rejects_small_input_buffer() {
        let mut config = Config::default();
        config.port.input_buffer_size = 16;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.port.write_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.ble.connect_join_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("Temp dir");
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.port.write_timeout_ms = 250;
        config.save(&path).expect("Save");

        let loaded = Config::load(&path).expect("Load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file() {
        let dir = tempfile::tempdir().expect("Temp dir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").expect("Write");

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }
}
