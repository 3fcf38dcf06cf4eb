//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (increments > 0, backoff cap >= step)
//! - Check that addresses parse and TLS material is complete
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: NetworkConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is handed to the engine

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::NetworkConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
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

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &NetworkConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let buffers = &config.buffers;
    for (field, value) in [
        ("buffers.read_increment", buffers.read_increment),
        ("buffers.write_increment", buffers.write_increment),
        ("buffers.write_queue_increment", buffers.write_queue_increment),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    let event_loop = &config.event_loop;
    if event_loop.event_capacity == 0 {
        errors.push(ValidationError::new(
            "event_loop.event_capacity",
            "must be greater than 0",
        ));
    }
    if event_loop.error_budget == 0 {
        errors.push(ValidationError::new(
            "event_loop.error_budget",
            "must be greater than 0",
        ));
    }
    if event_loop.max_backoff_ms < event_loop.backoff_step_ms {
        errors.push(ValidationError::new(
            "event_loop.max_backoff_ms",
            format!(
                "{} is below backoff_step_ms ({})",
                event_loop.max_backoff_ms, event_loop.backoff_step_ms
            ),
        ));
    }
    if event_loop.handshake_task_limit == 0 {
        errors.push(ValidationError::new(
            "event_loop.handshake_task_limit",
            "must be greater than 0",
        ));
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    let observability = &config.observability;
    if !LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", observability.log_level),
        ));
    }
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    match &config.tls {
        Some(tls) => {
            if tls.cert_path.is_some() != tls.key_path.is_some() {
                errors.push(ValidationError::new(
                    "tls",
                    "cert_path and key_path must be given together",
                ));
            }
            if tls.server_name.is_empty() {
                errors.push(ValidationError::new("tls.server_name", "must not be empty"));
            }
        }
        None => {
            if config.listener.tls || config.client.tls {
                errors.push(ValidationError::new(
                    "tls",
                    "section is required when listener.tls or client.tls is set",
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
