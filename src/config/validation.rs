//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, prefetch > 0, addresses parse)
//! - Check the broker is reachable in principle (address present, scheme known)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function of the loaded config
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;
use url::Url;

use crate::config::schema::{
    BrokerConfig, GatewayConfig, ObservabilityConfig, QueueConfig, WorkerConfig,
};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// One semantic problem in a loaded config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_gateway(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("`{}` is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.request_timeout_secs == 0 {
        errors.push(ValidationError::new("listener.request_timeout_secs", "must be greater than 0"));
    }
    if config.listener.max_body_size == 0 {
        errors.push(ValidationError::new("listener.max_body_size", "must be greater than 0"));
    }
    if config.rpc.timeout_ms == 0 {
        errors.push(ValidationError::new("rpc.timeout_ms", "must be greater than 0"));
    }

    check_broker(&config.broker, &mut errors);
    check_queues(&config.queues, &mut errors);
    check_observability(&config.observability, &mut errors);

    finish(errors)
}

pub fn validate_worker(config: &WorkerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.worker.queue.trim().is_empty() {
        errors.push(ValidationError::new("worker.queue", "must not be empty"));
    }
    if config.worker.prefetch == 0 {
        errors.push(ValidationError::new("worker.prefetch", "must be greater than 0"));
    }
    if config.worker.drain_timeout_secs == 0 {
        errors.push(ValidationError::new(
            "worker.drain_timeout_secs",
            "must be greater than 0",
        ));
    }

    check_broker(&config.broker, &mut errors);
    check_observability(&config.observability, &mut errors);

    finish(errors)
}

fn finish(errors: Vec<ValidationError>) -> Result<(), Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_broker(broker: &BrokerConfig, errors: &mut Vec<ValidationError>) {
    match &broker.url {
        Some(url) => match Url::parse(url) {
            Ok(parsed) if matches!(parsed.scheme(), "amqp" | "amqps") => {}
            Ok(parsed) => errors.push(ValidationError::new(
                "broker.url",
                format!("unsupported scheme `{}`", parsed.scheme()),
            )),
            Err(err) => errors.push(ValidationError::new("broker.url", err.to_string())),
        },
        None => match &broker.host {
            Some(host) if !host.trim().is_empty() => {
                if broker.port == 0 {
                    errors.push(ValidationError::new("broker.port", "must be greater than 0"));
                }
            }
            _ => errors.push(ValidationError::new(
                "broker",
                "either `url` or `host` must be set",
            )),
        },
    }

    if broker.connect_attempts == 0 {
        errors.push(ValidationError::new("broker.connect_attempts", "must be at least 1"));
    }
    if broker.connect_backoff_max_ms < broker.connect_backoff_ms {
        errors.push(ValidationError::new(
            "broker.connect_backoff_max_ms",
            "must not be smaller than connect_backoff_ms",
        ));
    }
}

fn check_queues(queues: &QueueConfig, errors: &mut Vec<ValidationError>) {
    if queues.commands.trim().is_empty() {
        errors.push(ValidationError::new("queues.commands", "must not be empty"));
    }
    let overrides = [
        ("queues.list", &queues.list),
        ("queues.get", &queues.get),
        ("queues.create", &queues.create),
        ("queues.update", &queues.update),
        ("queues.delete", &queues.delete),
    ];
    for (field, queue) in overrides {
        if matches!(queue, Some(name) if name.trim().is_empty()) {
            errors.push(ValidationError::new(field, "must not be empty when set"));
        }
    }
}

fn check_observability(observability: &ObservabilityConfig, errors: &mut Vec<ValidationError>) {
    if !LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level `{}`", observability.log_level),
        ));
    }
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("`{}` is not a socket address", observability.metrics_address),
        ));
    }
}
