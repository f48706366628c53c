//! # Error Types Module
//!
//! Centralized error handling for pulse-relay.
//! One error type per concern, each with a readable message and, where there
//! is an underlying cause, proper error chaining.
//!
//! ## Error Types
//! - `ConnectionError`: Bluetooth adapter, connect and link failures
//! - `ScanError`: Bluetooth device scanning errors
//! - `StoreError`: sample persistence and history queries
//! - `ConfigError`: configuration file I/O and parsing errors
//!
//! ## Propagation
//! The device manager resolves `ConnectionError`s itself through phase
//! transitions; they only reach callers of the control surface. The store
//! reports `StoreError::PersistenceUnavailable` to the log and keeps
//! buffering, it never hands it to viewers.

use std::fmt;
use std::time::Duration;

/// Errors that can occur while talking to a heart-rate peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// No Bluetooth radio on this machine. Permanent for the process lifetime.
    AdapterUnavailable,
    /// The requested address was not seen on the radio
    DeviceNotFound(String),
    /// Connect, service discovery or notification subscription failed
    ConnectFailed { address: String, reason: String },
    /// The link stayed silent for longer than the liveness window
    NotificationTimeout(Duration),
    /// The device manager task is gone (shutting down)
    ManagerUnavailable,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::AdapterUnavailable => {
                write!(f, "No Bluetooth adapter found. Please ensure Bluetooth is enabled.")
            }
            ConnectionError::DeviceNotFound(address) => {
                write!(f, "Device {} was not found", address)
            }
            ConnectionError::ConnectFailed { address, reason } => {
                write!(f, "Failed to connect to device {}: {}", address, reason)
            }
            ConnectionError::NotificationTimeout(window) => {
                write!(f, "No heart rate notification for {} ms", window.as_millis())
            }
            ConnectionError::ManagerUnavailable => {
                write!(f, "Device manager is not running")
            }
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Errors that can occur during device scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// No Bluetooth adapters available
    AdapterUnavailable,
    /// Scan operation failed
    ScanFailed(String),
    /// The device manager task is gone (shutting down)
    ManagerUnavailable,
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::AdapterUnavailable => {
                write!(f, "No Bluetooth adapters found")
            }
            ScanError::ScanFailed(msg) => {
                write!(f, "Scan operation failed: {}", msg)
            }
            ScanError::ManagerUnavailable => {
                write!(f, "Device manager is not running")
            }
        }
    }
}

impl std::error::Error for ScanError {}

impl From<ScanError> for ConnectionError {
    fn from(err: ScanError) -> Self {
        match err {
            ScanError::AdapterUnavailable => ConnectionError::AdapterUnavailable,
            ScanError::ManagerUnavailable => ConnectionError::ManagerUnavailable,
            ScanError::ScanFailed(reason) => ConnectionError::ConnectFailed {
                address: String::new(),
                reason,
            },
        }
    }
}

/// Errors that can occur while persisting or reading samples
#[derive(Debug)]
pub enum StoreError {
    /// Storage cannot take writes right now; samples are buffered in memory
    PersistenceUnavailable(String),
    /// SQLite reported an error
    Sqlite(rusqlite::Error),
    /// The background writer thread has stopped
    WriterUnavailable,
    /// A history query could not be executed
    QueryFailed(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::PersistenceUnavailable(msg) => {
                write!(f, "Persistence unavailable, buffering samples in memory: {}", msg)
            }
            StoreError::Sqlite(e) => {
                write!(f, "Database error: {}", e)
            }
            StoreError::WriterUnavailable => {
                write!(f, "Sample writer thread is not running")
            }
            StoreError::QueryFailed(msg) => {
                write!(f, "History query failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err)
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}
