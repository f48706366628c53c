//! # Configuration Management Module
//!
//! Persistent application settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Sections
//! - `device`: transport selection, autoconnect, liveness and reconnect policy
//! - `mock`: cadence and bounds of the synthetic heart-rate walk
//! - `hub`: per-viewer queue capacity
//! - `store`: database location, retry cadence and buffering limits
//! - `server`: bind address, raw history cap and default history limit
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/pulse-relay/config.toml
//! - Linux: ~/.config/pulse-relay/config.toml
//! - Windows: %APPDATA%\pulse-relay\config.toml
//!
//! `PULSE_RELAY_CONFIG` overrides the path. Every key is optional; missing
//! keys take their default so old files keep loading after upgrades.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::ConfigError;

const APP_DIR: &str = "pulse-relay";
const CONFIG_ENV: &str = "PULSE_RELAY_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Real radio through btleplug
    Ble,
    /// In-process simulated heart-rate monitor, no hardware needed
    Mock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub transport: TransportKind,
    /// Connect to the strongest heart-rate device when nothing else is preferred
    pub enable_autoconnect: bool,
    pub preferred_address: Option<String>,
    pub scan_seconds: u64,
    pub liveness_ms: u64,
    pub connect_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter: bool,
    pub max_reconnect_attempts: u32,
    pub rescan_seconds: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Ble,
            enable_autoconnect: false,
            preferred_address: None,
            scan_seconds: 5,
            liveness_ms: 5_000,
            connect_timeout_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            backoff_jitter: false,
            max_reconnect_attempts: 5,
            rescan_seconds: 30,
        }
    }
}

impl DeviceConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(self.scan_seconds)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub interval_ms: u64,
    pub min_bpm: u16,
    pub max_bpm: u16,
    pub max_step: u16,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            min_bpm: 55,
            max_bpm: 150,
            max_step: 3,
        }
    }
}

impl MockConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub viewer_queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { viewer_queue_capacity: 64 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database: PathBuf,
    pub retry_interval_ms: u64,
    pub max_buffered: usize,
    /// Rows fetched per round trip by the raw history cursor
    pub page_size: usize,
    /// Closed-range aggregate results kept in the LRU cache
    pub cache_entries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database: data_dir.join(APP_DIR).join("heart_rate.db"),
            retry_interval_ms: 2_000,
            max_buffered: 100_000,
            page_size: 512,
            cache_entries: 128,
        }
    }
}

impl StoreConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_raw_rows: usize,
    /// Entries returned when a history request names no limit; 0 for all
    pub history_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            max_raw_rows: 100_000,
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub shutdown_timeout_ms: u64,
    pub device: DeviceConfig,
    pub mock: MockConfig,
    pub hub: HubConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 5_000,
            device: DeviceConfig::default(),
            mock: MockConfig::default(),
            hub: HubConfig::default(),
            store: StoreConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Get the path to the config file
    fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join(APP_DIR).join("config.toml")
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Load config from the default location, or create it if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, writing the defaults there if the file is missing
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents)
                    .map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string)
            .map_err(ConfigError::WriteFailed)?;

        Ok(())
    }
}
