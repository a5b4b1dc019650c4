//! Configuration management
//!
//! Settings come from an optional configuration file, overridden by
//! `RELOCATED__*` environment variables, e.g.
//! `RELOCATED__RELOCATES__MAX_TIMEOUT_SECS=120` or
//! `RELOCATED__RELOCATES__DEFAULT_COMPLETIONS=answer,api`.

use ::config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::domain::relocate::Completion;

const ENV_PREFIX: &str = "RELOCATED";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub relocates: RelocatesConfig,
    pub telephony: TelephonyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, `RUST_LOG` wins when set
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocatesConfig {
    /// Completions applied when a request does not name any
    pub default_completions: Vec<Completion>,
    /// Timeout applied when a request does not give one; none means no timeout
    pub default_timeout_secs: Option<u64>,
    pub max_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    /// Capacity of the engine event channel before slow consumers lag
    pub event_buffer: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for RelocatesConfig {
    fn default() -> Self {
        Self {
            default_completions: vec![Completion::Answer],
            default_timeout_secs: None,
            max_timeout_secs: 600,
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self { event_buffer: 1024 }
    }
}

impl Config {
    /// Load the configuration, starting from defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let config: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("relocates.default_completions"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.relocates.max_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "relocates.max_timeout_secs must be positive".to_string(),
            ));
        }
        if let Some(default) = self.relocates.default_timeout_secs {
            if default == 0 || default > self.relocates.max_timeout_secs {
                return Err(ConfigError::Message(format!(
                    "relocates.default_timeout_secs must be between 1 and {}",
                    self.relocates.max_timeout_secs
                )));
            }
        }
        if self.telephony.event_buffer == 0 {
            return Err(ConfigError::Message(
                "telephony.event_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
