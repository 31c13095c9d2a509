//! Configuration for the session and delivery core.
//!
//! Every section is optional in TOML and falls back to its default. A small
//! set of environment variables overrides the parsed values before validation.

use serde::Deserialize;

use crate::XmppError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<ConfigError> for XmppError {
    fn from(err: ConfigError) -> Self {
        XmppError::config(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct C2sConfig {
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for C2sConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            stream: StreamConfig::default(),
            offline: OfflineConfig::default(),
            registration: RegistrationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Capacity of each stream's outbound sink.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfflineConfig {
    /// Maximum number of messages stored per account.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationConfig {
    #[serde(default)]
    pub allow_registration: bool,
    #[serde(default = "default_true")]
    pub allow_change: bool,
    #[serde(default = "default_true")]
    pub allow_cancel: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            allow_registration: false,
            allow_change: true,
            allow_cancel: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    domain: Option<String>,
    queue_size: Option<String>,
    log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_queue_size() -> usize {
    2500
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Parse configuration from a TOML string, applying environment overrides.
pub fn load_config_from_str(toml_str: &str) -> Result<C2sConfig, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<C2sConfig, ConfigError> {
    let mut config: C2sConfig = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides)?;
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        domain: std::env::var("WADDLE_DOMAIN").ok(),
        queue_size: std::env::var("WADDLE_OFFLINE_QUEUE_SIZE").ok(),
        log_level: std::env::var("WADDLE_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut C2sConfig, overrides: ConfigOverrides) -> Result<(), ConfigError> {
    if let Some(domain) = overrides.domain {
        config.domain = domain;
    }
    if let Some(raw) = overrides.queue_size {
        config.offline.queue_size = raw.parse().map_err(|_| ConfigError::InvalidValue {
            field: "offline.queue_size".to_string(),
            message: format!("'{}' is not a positive integer", raw),
        })?;
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
    Ok(())
}

fn validate(config: &C2sConfig) -> Result<(), ConfigError> {
    if config.domain.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "domain".to_string(),
            message: "must not be empty".to_string(),
        });
    }

    if config.offline.queue_size == 0 {
        return Err(ConfigError::InvalidValue {
            field: "offline.queue_size".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if config.stream.outbound_capacity == 0 {
        return Err(ConfigError::InvalidValue {
            field: "stream.outbound_capacity".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}
