// src/config/mod.rs - Host configuration
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub serial: SerialConfig,
}

/// HTTP/WebSocket listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Serial session settings shared by every port.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SerialConfig {
    /// Baudrate used when a client does not ask for one.
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// How often the session polls the machine with `?`.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often queue progress is considered for broadcast.
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_baudrate() -> u32 {
    115200
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_report_interval_ms() -> u64 {
    500
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baudrate: default_baudrate(),
            poll_interval_ms: default_poll_interval_ms(),
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            serial: SerialConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file. A missing file is not an
    /// error; defaults apply so the host runs with zero setup.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        if !Path::new(path).exists() {
            tracing::info!("config file {} not found, using defaults", path);
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("loaded configuration from {}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baudrate == 0 {
            return Err(ConfigError::Invalid("baudrate must be positive".into()));
        }
        if self.serial.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.serial.report_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "report_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
