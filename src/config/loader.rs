//! Configuration loading from disk and environment.
//!
//! Order of precedence: defaults, then the TOML file (if any), then
//! environment variables. Validation runs last, on the merged result.

use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::config::schema::{
    BrokerConfig, GatewayConfig, LogFormat, ObservabilityConfig, WorkerConfig,
};
use crate::config::validation::{validate_gateway, validate_worker, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A root config type that can be loaded by [`load_config`].
pub trait ServiceConfig: DeserializeOwned + Default {
    /// Apply environment overrides through `env`.
    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) -> Result<(), ConfigError>;

    fn validate(&self) -> Result<(), Vec<ValidationError>>;
}

/// Load, override from the process environment, and validate.
pub fn load_config<T: ServiceConfig>(path: Option<&Path>) -> Result<T, ConfigError> {
    load_config_with_env(path, |var| std::env::var(var).ok())
}

/// Same as [`load_config`] with an explicit environment lookup.
pub fn load_config_with_env<T, F>(path: Option<&Path>, env: F) -> Result<T, ConfigError>
where
    T: ServiceConfig,
    F: Fn(&str) -> Option<String>,
{
    let mut config: T = match path {
        Some(path) => {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        }
        None => T::default(),
    };

    config.apply_env(&env)?;
    config.validate().map_err(ConfigError::Validation)?;
    Ok(config)
}

impl ServiceConfig for GatewayConfig {
    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        apply_broker_env(&mut self.broker, env)?;
        apply_observability_env(&mut self.observability, env)?;

        if let Some(addr) = env("TODO_BIND_ADDRESS") {
            self.listener.bind_address = addr;
        }
        if let Some(value) = env("TODO_RPC_TIMEOUT_MS") {
            self.rpc.timeout_ms = parse_var("TODO_RPC_TIMEOUT_MS", &value)?;
        }
        if let Some(queue) = env("OUTBOUND_QUEUE_NAME") {
            self.queues.commands = queue;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), Vec<ValidationError>> {
        validate_gateway(self)
    }
}

impl ServiceConfig for WorkerConfig {
    fn apply_env(&mut self, env: &dyn Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        apply_broker_env(&mut self.broker, env)?;
        apply_observability_env(&mut self.observability, env)?;

        if let Some(queue) = env("INBOUND_QUEUE_NAME") {
            self.worker.queue = queue;
        }
        if let Some(value) = env("TODO_PREFETCH") {
            self.worker.prefetch = parse_var("TODO_PREFETCH", &value)?;
        }
        if let Some(value) = env("TODO_DRAIN_TIMEOUT_SECS") {
            self.worker.drain_timeout_secs = parse_var("TODO_DRAIN_TIMEOUT_SECS", &value)?;
        }
        if let Some(path) = env("TODO_SNAPSHOT_PATH") {
            self.storage.snapshot_path = Some(path.into());
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), Vec<ValidationError>> {
        validate_worker(self)
    }
}

fn apply_broker_env(
    broker: &mut BrokerConfig,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(url) = env("TODO_BROKER_URL") {
        broker.url = Some(url);
    }
    if let Some(host) = env("TODO_BROKER_HOST") {
        broker.host = Some(host);
    }
    if let Some(value) = env("TODO_BROKER_PORT") {
        broker.port = parse_var("TODO_BROKER_PORT", &value)?;
    }
    if let Some(user) = env("TODO_BROKER_USER") {
        broker.username = user;
    }
    if let Some(password) = env("TODO_BROKER_PASSWORD") {
        broker.password = password;
    }
    Ok(())
}

fn apply_observability_env(
    observability: &mut ObservabilityConfig,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(level) = env("TODO_LOG_LEVEL") {
        observability.log_level = level;
    }
    if let Some(format) = env("TODO_LOG_FORMAT") {
        observability.log_format = match format.to_ascii_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::Env {
                    var: "TODO_LOG_FORMAT".to_string(),
                    reason: format!("expected `pretty` or `json`, got `{other}`"),
                })
            }
        };
    }
    Ok(())
}

fn parse_var<V>(var: &str, value: &str) -> Result<V, ConfigError>
where
    V: FromStr,
    V::Err: Display,
{
    value.trim().parse().map_err(|err: V::Err| ConfigError::Env {
        var: var.to_string(),
        reason: err.to_string(),
    })
}
