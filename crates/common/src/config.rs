//! Configuration management
//!
//! Settings are read from a TOML file. Every field has a default, so an empty
//! file (or no file at all) yields a working configuration.
//!
//! # Example Configuration
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [device]
//! report_buffer_size = 64
//! blocking = false
//! read_transfer_timeout_ms = 30000
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Accepted log levels
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub device: DeviceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "warn".to_string()
    }
}

/// Per-device runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Maximum number of input reports kept while nobody reads
    #[serde(default = "DeviceSettings::default_report_buffer_size")]
    pub report_buffer_size: usize,
    /// Whether `read` waits for a report
    #[serde(default = "DeviceSettings::default_blocking")]
    pub blocking: bool,
    /// Timeout of the background interrupt IN transfer. Only used to notice
    /// stalled hardware; an expiry just resubmits the transfer.
    #[serde(default = "DeviceSettings::default_read_transfer_timeout_ms")]
    pub read_transfer_timeout_ms: u64,
    /// Timeout for SET_REPORT / GET_REPORT control transfers
    #[serde(default = "DeviceSettings::default_control_timeout_ms")]
    pub control_timeout_ms: u64,
    /// Timeout for interrupt OUT writes
    #[serde(default = "DeviceSettings::default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Timeout handed to each event-processing call of the read loop
    /// (0 = poll without blocking)
    #[serde(default)]
    pub event_poll_timeout_ms: u64,
    /// Detach an active kernel driver before claiming the interface
    #[serde(default = "DeviceSettings::default_detach_kernel_driver")]
    pub detach_kernel_driver: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            report_buffer_size: Self::default_report_buffer_size(),
            blocking: Self::default_blocking(),
            read_transfer_timeout_ms: Self::default_read_transfer_timeout_ms(),
            control_timeout_ms: Self::default_control_timeout_ms(),
            write_timeout_ms: Self::default_write_timeout_ms(),
            event_poll_timeout_ms: 0,
            detach_kernel_driver: Self::default_detach_kernel_driver(),
        }
    }
}

impl DeviceSettings {
    fn default_report_buffer_size() -> usize {
        32
    }

    fn default_blocking() -> bool {
        true
    }

    fn default_read_transfer_timeout_ms() -> u64 {
        30_000
    }

    fn default_control_timeout_ms() -> u64 {
        1_000
    }

    fn default_write_timeout_ms() -> u64 {
        1_000
    }

    fn default_detach_kernel_driver() -> bool {
        true
    }

    pub fn read_transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.read_transfer_timeout_ms)
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn event_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.event_poll_timeout_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.report_buffer_size == 0 {
            return Err(Error::Config(
                "report_buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from `path`, or from the first existing standard
    /// location when `path` is `None`.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/hid-usb/config.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| Error::Config("No configuration file found".to_string()))?
        };

        let content = fs::read_to_string(&config_path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            ))
        })?;

        let config = Self::from_toml(&content).map_err(|e| match e {
            Error::Config(msg) => {
                Error::Config(format!("{} ({})", msg, config_path.display()))
            }
            other => other,
        })?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize configuration: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, content)?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hid-usb").join("config.toml")
        } else {
            PathBuf::from(".config/hid-usb/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }

        self.device.validate()
    }
}

/// Load configuration from a path string, expanding a leading `~`
pub fn load_config(path: &str) -> Result<Config> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    Config::load(Some(path_buf))
}
