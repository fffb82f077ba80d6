//! Server configuration loaded from a TOML file.
//!
//! Every key is optional and falls back to its default. Command-line flags
//! in the server binary override file values after loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "spacepark.toml";
pub const DEFAULT_DB_FILE: &str = "park.db";
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_PORT_SPAN: u16 = 100;
pub const DEFAULT_MAX_CLIENTS: usize = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to render TOML: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub bind_address: String,
    /// First port tried when binding.
    pub port: u16,
    /// Last port tried, inclusive. Defaults to `port + 100`.
    pub port_range_end: Option<u16>,
    pub max_clients: usize,
    /// Close connections that go this long without receiving any data.
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_FILE),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            port_range_end: None,
            max_clients: DEFAULT_MAX_CLIENTS,
            idle_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the default configuration to `path`.
    pub fn write_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = Self::default();
        let text = toml::to_string_pretty(&config)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1".into()));
        }
        if self.last_port() < self.port {
            return Err(ConfigError::Invalid(format!(
                "port_range_end {} is below port {}",
                self.last_port(),
                self.port
            )));
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid("idle_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn last_port(&self) -> u16 {
        self.port_range_end
            .unwrap_or_else(|| self.port.saturating_add(DEFAULT_PORT_SPAN))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}
