//! Application settings

use crate::core::event::DEFAULT_EVENT_CAPACITY;
use crate::core::framing::DEFAULT_MAX_FRAME_LEN;
use crate::core::logger::DEFAULT_QUEUE_CAPACITY;
use crate::core::registry::RegistryConfig;
use crate::core::transport::{SerialConfig, TcpConfig, TelnetConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CONFIG_FILE: &str = "config.toml";

/// Configuration load/save errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File access failed
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be rendered
    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default serial line settings
    pub serial: SerialConfig,
    /// Raw TCP options
    pub tcp: TcpConfig,
    /// Telnet login and timing
    pub telnet: TelnetConfig,
    /// Read task settings shared by serial and TCP
    pub registry: RegistrySettings,
    /// Journal settings
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Path of the config file in the platform config directory
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        super::config_dir()
            .map(|dir| dir.join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load config from the platform config directory
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load config from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Save config to the platform config directory
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path()?)
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_error)?;
        Ok(())
    }
}

/// Read task settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Read deadline per poll in milliseconds
    pub read_timeout_ms: u64,
    /// Read buffer size
    pub read_buffer_size: usize,
    /// Longest line kept while waiting for CR LF
    pub max_frame_len: usize,
    /// Capacity of the inbound event channel
    pub event_capacity: usize,
}

impl RegistrySettings {
    /// Registry tuning derived from these settings
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            read_timeout_ms: self.read_timeout_ms,
            read_buffer_size: self.read_buffer_size.max(1),
            max_frame_len: self.max_frame_len,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        let read = RegistryConfig::default();
        Self {
            read_timeout_ms: read.read_timeout_ms,
            read_buffer_size: read.read_buffer_size,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Journal settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Root directory for journal files; platform data dir when unset
    pub directory: Option<PathBuf>,
    /// Pending lines per channel before producers block
    pub queue_capacity: usize,
    /// Channel name, also the journal subdirectory
    pub channel: String,
}

impl LoggingSettings {
    /// Directory journal channels are created under
    pub fn log_dir(&self) -> PathBuf {
        self.directory
            .clone()
            .or_else(super::log_dir)
            .unwrap_or_else(|| PathBuf::from("logs"))
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            channel: "Commander".to_string(),
        }
    }
}
