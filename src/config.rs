//! Configuration management for Keyrate.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{KeyrateError, Result};

/// Prefix for environment overrides, e.g. `KEYRATE__LIMITER__CONFIG_KEY`.
const ENV_PREFIX: &str = "KEYRATE";

/// Main configuration for the Keyrate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyrateConfig {
    /// Limiter and reload configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Rule source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What to do when the initial rule load fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPolicy {
    /// Start with no rules and admit everything until a reload succeeds
    #[default]
    FailOpen,
    /// Abort startup
    FailFast,
}

/// Limiter and reload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Lookup key of the rule set in the config source
    #[serde(default = "default_config_key")]
    pub config_key: String,

    /// Interval between periodic reloads in seconds
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,

    /// Capacity of the channel sources push rule sets into
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Behaviour when the initial load fails
    #[serde(default)]
    pub startup_policy: StartupPolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            config_key: default_config_key(),
            reload_interval_secs: default_reload_interval(),
            channel_capacity: default_channel_capacity(),
            startup_policy: StartupPolicy::default(),
        }
    }
}

impl LimiterConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

fn default_config_key() -> String {
    "ratelimit".to_string()
}

fn default_reload_interval() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    16
}

/// Which backend serves the rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A local YAML or JSON file
    #[default]
    File,
    /// An empty in-memory source
    Memory,
}

/// Rule source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,

    /// Path to the rule file
    #[serde(default = "default_rules_path")]
    pub path: PathBuf,

    /// Interval at which the file source checks for changes, in seconds.
    /// Zero disables the watch.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            path: default_rules_path(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_rules_path() -> PathBuf {
    PathBuf::from("rules.yaml")
}

fn default_poll_interval() -> u64 {
    5
}

/// Output format for logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl KeyrateConfig {
    /// Load configuration from an optional YAML file layered with
    /// `KEYRATE__`-prefixed environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(true),
            );
        }

        let config: KeyrateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: KeyrateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| KeyrateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.limiter.reload_interval_secs == 0 {
            return Err(KeyrateError::Config(
                "limiter.reload_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.limiter.channel_capacity == 0 {
            return Err(KeyrateError::Config(
                "limiter.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.limiter.config_key.is_empty() {
            return Err(KeyrateError::Config("limiter.config_key must not be empty".to_string()));
        }
        Ok(())
    }
}
