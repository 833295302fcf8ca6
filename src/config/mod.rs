//! Configuration Module
//!
//! Provides TOML-based configuration with support for:
//! - Log level
//! - Maximum granted QoS
//! - Per-connection flow-control limits
//! - Retransmission tuning
//! - Environment variable overrides (VIBEMQ_DELIVERY__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::protocol::QoS;


/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "VIBEMQ_DELIVERY";

/// Substitute `${VAR}` and `${VAR:-default}` references in `content`
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Config(config::ConfigError),
    Pattern(regex::Error),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Pattern(e) => write!(f, "Substitution pattern error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl From<regex::Error> for ConfigError {
    fn from(e: regex::Error) -> Self {
        ConfigError::Pattern(e)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Per-connection limits
    pub limits: LimitsConfig,
    /// Retransmission configuration
    pub delivery: DeliveryConfig,
    /// Session configuration
    pub session: SessionConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS granted to subscriptions (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
}

fn default_max_qos() -> u8 {
    2
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Concurrent outbound QoS 1/2 messages per connection (0 = unlimited)
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Messages queued while the in-flight window is full
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Inbound QoS 2 messages awaiting PUBREL (0 = unlimited)
    #[serde(default = "default_max_awaiting_rel")]
    pub max_awaiting_rel: usize,
}

fn default_max_inflight() -> usize {
    32
}
fn default_max_queued_messages() -> usize {
    1000
}
fn default_max_awaiting_rel() -> usize {
    100
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            max_queued_messages: default_max_queued_messages(),
            max_awaiting_rel: default_max_awaiting_rel(),
        }
    }
}

/// Retransmission configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Time before an unacknowledged QoS 1/2 message is resent
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Resends before the delivery is reported as failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_max_retries() -> u32 {
    3
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time allowed between accept and CONNECT
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a file, with environment overrides
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("mqtt.max_qos", 2)?
            .set_default("limits.max_inflight", 32)?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.max_awaiting_rel", 100)?
            .set_default("delivery.retry_interval", "30s")?
            .set_default("delivery.max_retries", 3)?
            .set_default("session.connect_timeout", "30s")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // VIBEMQ_DELIVERY__LIMITS__MAX_INFLIGHT etc.
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from defaults and environment only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.delivery.retry_interval.is_zero() {
            return Err(ConfigError::Validation(
                "retry_interval must be greater than zero".to_string(),
            ));
        }

        // Note: 0 means unbounded for max_inflight and max_awaiting_rel

        Ok(())
    }

    /// Maximum QoS as a protocol value
    pub fn max_qos(&self) -> QoS {
        QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce)
    }

    /// Runtime broker configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_qos: self.max_qos(),
            max_inflight: self.limits.max_inflight,
            max_queued_messages: self.limits.max_queued_messages,
            max_awaiting_rel: self.limits.max_awaiting_rel,
            retry_interval: self.delivery.retry_interval,
            max_retries: self.delivery.max_retries,
            connect_timeout: self.session.connect_timeout,
        }
    }
}
