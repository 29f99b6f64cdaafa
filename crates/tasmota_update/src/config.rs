//! Configuration file parsing and structures.
//!
//! tasmota-update reads a single TOML file describing the MQTT broker, the
//! release feed, the optional HTTP API and the devices to manage.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::device::Device;
use crate::device::DeviceTopic;
use crate::mqtt::MqttConfig;

/// Top-level configuration structure
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub api: Option<ApiConfig>,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `rumqttc = "warn"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the subscriber filter for these settings
    pub fn targets(&self) -> Targets {
        Targets::new()
            .with_default(LevelFilter::from(self.level))
            .with_targets(
                self.overrides
                    .iter()
                    .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
            )
    }
}

fn default_feed_url() -> String {
    "https://api.github.com/repos/arendst/Tasmota/releases/latest".to_string()
}

fn default_feed_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    concat!("tasmota-update/", env!("CARGO_PKG_VERSION")).to_string()
}

/// Release feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// URL of a GitHub `releases/latest` endpoint
    #[serde(default = "default_feed_url")]
    pub url: String,

    /// Request timeout
    #[serde(default = "default_feed_timeout_secs")]
    pub timeout_secs: u64,

    /// GitHub rejects requests without a User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            timeout_secs: default_feed_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_api_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8565
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// A device entry, keyed by its id in `[devices.<id>]`
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// MQTT topic of the device
    pub topic: String,

    /// Display name; defaults to the device id
    #[serde(default)]
    pub name: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.response_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "mqtt.response_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.feed.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "feed.timeout_secs must be greater than zero".to_string(),
            ));
        }

        for (id, device) in &self.devices {
            if device.topic.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "devices.{}.topic must not be empty",
                    id
                )));
            }
        }

        Ok(())
    }

    /// Resolved devices, keyed by id
    pub fn devices(&self) -> BTreeMap<String, Device> {
        self.devices
            .iter()
            .map(|(id, device)| {
                let name = device.name.clone().unwrap_or_else(|| id.clone());
                (
                    id.clone(),
                    Device {
                        name,
                        topic: DeviceTopic::new(device.topic.clone()),
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
