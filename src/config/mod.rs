//! # Configuration Management Module
//!
//! Loads and validates the gateway's TOML configuration.
//!
//! ## Configuration Structure
//!
//! - [`GatewayConfig`] - Instance name
//! - [`DispatchConfig`] - Buffer sizing, refill wake-up tuning and retry limit
//! - [`DeviceConfig`] - One entry per attached modem
//! - [`StorageConfig`] - Where the message database lives
//! - [`LoggingConfig`] - Log level and optional log file
//!
//! ## Configuration File Format
//!
//! ```toml
//! [gateway]
//! name = "smsgate"
//!
//! [dispatch]
//! buffer_size = 50
//! buffer_low = 10
//! wakeup_timeout_secs = 60
//! wakeup_count_threshold = 10
//! long_poll_timeout_secs = 600
//! retry_limit = 3
//!
//! [[devices]]
//! device_id = "modem0"
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//!
//! [storage]
//! data_dir = "./data"
//!
//! [logging]
//! level = "info"
//! file = "smsgate.log"
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use smsgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("smsgate.toml").await?;
//!     config.validate()?;
//!     println!("{} device(s) configured", config.devices.len());
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub name: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: "smsgate".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Capacity of the in-memory dispatch buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Refill only when occupancy drops below this watermark.
    #[serde(default = "default_buffer_low")]
    pub buffer_low: usize,
    /// Wake the refill controller when the last wake-up is older than this.
    #[serde(default = "default_wakeup_timeout_secs")]
    pub wakeup_timeout_secs: u64,
    /// Wake the refill controller after this many submissions without one.
    #[serde(default = "default_wakeup_count_threshold")]
    pub wakeup_count_threshold: u32,
    /// Fallback poll interval when nobody wakes the refill controller.
    #[serde(default = "default_long_poll_timeout_secs")]
    pub long_poll_timeout_secs: u64,
    /// Transmit attempts per message before it is retired.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Pause between two messages on the same worker (microseconds).
    #[serde(default = "default_pacing_micros")]
    pub pacing_micros: u64,
}

fn default_buffer_size() -> usize {
    50
}
fn default_buffer_low() -> usize {
    10
}
fn default_wakeup_timeout_secs() -> u64 {
    60
}
fn default_wakeup_count_threshold() -> u32 {
    10
}
fn default_long_poll_timeout_secs() -> u64 {
    600
}
fn default_retry_limit() -> u32 {
    3
}
fn default_pacing_micros() -> u64 {
    500
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            buffer_low: default_buffer_low(),
            wakeup_timeout_secs: default_wakeup_timeout_secs(),
            wakeup_count_threshold: default_wakeup_count_threshold(),
            long_poll_timeout_secs: default_long_poll_timeout_secs(),
            retry_limit: default_retry_limit(),
            pacing_micros: default_pacing_micros(),
        }
    }
}

impl DispatchConfig {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            buffer_size: self.buffer_size,
            buffer_low: self.buffer_low,
            wakeup_timeout: Duration::from_secs(self.wakeup_timeout_secs),
            wakeup_count_threshold: self.wakeup_count_threshold,
            long_poll_timeout: Duration::from_secs(self.long_poll_timeout_secs),
            retry_limit: self.retry_limit,
            pacing: Duration::from_micros(self.pacing_micros),
        }
    }
}

/// Runtime form of [`DispatchConfig`] handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub buffer_size: usize,
    pub buffer_low: usize,
    pub wakeup_timeout: Duration,
    pub wakeup_count_threshold: u32,
    pub long_poll_timeout: Duration,
    pub retry_limit: u32,
    pub pacing: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchConfig::default().settings()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    115200
}
fn default_read_timeout_ms() -> u64 {
    1000
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "modem0".to_string(),
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl StorageConfig {
    /// Directory holding the sled message database.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("messages")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl LoggingConfig {
    /// Parsed `level`, falling back to Info on unknown names.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if d.buffer_size == 0 {
            return Err(anyhow!("dispatch.buffer_size must be at least 1"));
        }
        if d.buffer_low == 0 {
            return Err(anyhow!("dispatch.buffer_low must be at least 1"));
        }
        if d.buffer_low > d.buffer_size {
            return Err(anyhow!(
                "dispatch.buffer_low ({}) exceeds dispatch.buffer_size ({})",
                d.buffer_low,
                d.buffer_size
            ));
        }
        if d.retry_limit == 0 {
            return Err(anyhow!("dispatch.retry_limit must be at least 1"));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.port.trim().is_empty() {
                return Err(anyhow!("device {} has an empty port", device.device_id));
            }
            if !seen.insert(device.device_id.as_str()) {
                return Err(anyhow!("duplicate device_id {}", device.device_id));
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: GatewayConfig::default(),
            dispatch: DispatchConfig::default(),
            storage: StorageConfig {
                data_dir: "./data".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("smsgate.log".to_string()),
            },
            devices: vec![DeviceConfig::default()],
        }
    }
}
