// Configuration management for the bleport CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/bleport/config.json
// - Linux: ~/.config/bleport/config.json
// - Windows: %APPDATA%\bleport\config.json

use anyhow::{Context, Result};
use bleport_core::config::Config as CoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Index into the list of local Bluetooth adapters
    pub adapter_index: usize,

    /// Port buffers and BLE timing handed to the core
    #[serde(flatten)]
    pub core: CoreConfig,
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("bleport");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load the default config file, creating it if it does not exist
    pub fn load() -> Result<Self> {
        let config_file = Self::config_file()?;
        if config_file.exists() {
            Self::load_from(&config_file)
        } else {
            let config = Config::default();
            config.save_to(&config_file)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.core.validate().context("Invalid config file")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value. The result is validated but not saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut updated = self.clone();
        let port = &mut updated.core.port;
        let ble = &mut updated.core.ble;

        match key {
            "adapter_index" => {
                updated.adapter_index = value.parse().context("Invalid adapter index")?;
            }
            "write_timeout_ms" => port.write_timeout_ms = value.parse().context("Invalid number")?,
            "input_buffer_size" => {
                port.input_buffer_size = value.parse().context("Invalid number")?
            }
            "receive_buffer_size" => {
                port.receive_buffer_size = value.parse().context("Invalid number")?
            }
            "output_buffer_size" => {
                port.output_buffer_size = value.parse().context("Invalid number")?
            }
            "scan_duration_ms" => ble.scan_duration_ms = value.parse().context("Invalid number")?,
            "connect_join_timeout_ms" => {
                ble.connect_join_timeout_ms = value.parse().context("Invalid number")?
            }
            "attribute_read_timeout_ms" => {
                ble.attribute_read_timeout_ms = value.parse().context("Invalid number")?
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        updated.core.validate()?;
        *self = updated;
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        let port = &self.core.port;
        let ble = &self.core.ble;
        vec![
            ("adapter_index".to_string(), self.adapter_index.to_string()),
            ("write_timeout_ms".to_string(), port.write_timeout_ms.to_string()),
            ("input_buffer_size".to_string(), port.input_buffer_size.to_string()),
            ("receive_buffer_size".to_string(), port.receive_buffer_size.to_string()),
            ("output_buffer_size".to_string(), port.output_buffer_size.to_string()),
            ("scan_duration_ms".to_string(), ble.scan_duration_ms.to_string()),
            ("connect_join_timeout_ms".to_string(), ble.connect_join_timeout_ms.to_string()),
            ("attribute_read_timeout_ms".to_string(), ble.attribute_read_timeout_ms.to_string()),
        ]
    }
}
