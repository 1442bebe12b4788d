//! Configuration management for SecureMirror
//!
//! Defaults, overlaid by a TOML file and/or `SECUREMIRROR_*` environment
//! variables, then validated.

use crate::core_policy::{GrantPrecedence, PermissionEvaluator, PolicySet, TypePolicy};
use crate::logging::{LogConfig, LogLevel};
use serde::{Deserialize, Serialize};
use std::env;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Mirror behaviour
    pub mirror: MirrorConfig,

    /// Login bootstrap
    pub bootstrap: BootstrapConfig,

    /// Access policy per record type
    pub policies: Vec<TypePolicy>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Buffered events per broadcast subscriber
    pub event_capacity: usize,

    /// Which grant is reported when several apply
    pub grant_precedence: GrantPrecedence,
}

/// Login bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Type under which principal profiles live
    pub profile_type: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            grant_precedence: GrantPrecedence::TokenOrder,
        }
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            profile_type: "users".to_string(),
        }
    }
}

fn parse_precedence(raw: &str) -> Result<GrantPrecedence, ConfigError> {
    match raw {
        "token_order" => Ok(GrantPrecedence::TokenOrder),
        "roles_first" => Ok(GrantPrecedence::RolesFirst),
        "membership_first" => Ok(GrantPrecedence::MembershipFirst),
        other => Err(ConfigError::InvalidValue(format!(
            "Invalid grant precedence: {}",
            other
        ))),
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: SECUREMIRROR_<SECTION>_<KEY>
    /// Example: SECUREMIRROR_MIRROR_EVENT_CAPACITY=1024
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables on top of the current values
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Logging config
        if let Ok(level) = env::var("SECUREMIRROR_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = env::var("SECUREMIRROR_LOG_JSON") {
            self.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        // Mirror config
        if let Ok(capacity) = env::var("SECUREMIRROR_MIRROR_EVENT_CAPACITY") {
            self.mirror.event_capacity = capacity.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("Invalid event capacity: {}", e))
            })?;
        }
        if let Ok(precedence) = env::var("SECUREMIRROR_MIRROR_GRANT_PRECEDENCE") {
            self.mirror.grant_precedence = parse_precedence(&precedence)?;
        }

        // Bootstrap config
        if let Ok(profile_type) = env::var("SECUREMIRROR_BOOTSTRAP_PROFILE_TYPE") {
            self.bootstrap.profile_type = profile_type;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        // Validate mirror config
        if self.mirror.event_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        // Validate bootstrap config
        if self.bootstrap.profile_type.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "profile_type must not be empty".to_string(),
            ));
        }

        self.policy_set()?;
        Ok(())
    }

    /// The configured policies, checked for reserved names and duplicates
    pub fn policy_set(&self) -> Result<PolicySet, ConfigError> {
        Ok(PolicySet::from_policies(self.policies.iter().cloned())?)
    }

    /// Evaluator using the configured grant precedence
    pub fn evaluator(&self) -> PermissionEvaluator {
        PermissionEvaluator::new(self.mirror.grant_precedence)
    }

    /// Logging setup matching this configuration
    pub fn log_config(&self) -> Result<LogConfig, ConfigError> {
        let level: LogLevel = self
            .logging
            .level
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{}", e)))?;
        Ok(LogConfig::new(level)
            .json_format(self.logging.json_format)
            .with_timestamp(self.logging.with_timestamp)
            .with_target(self.logging.with_target))
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}
