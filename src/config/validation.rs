//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that control tokens and tagged data stay distinguishable
//! - Validate value ranges (TTL, delays, pool sizes > 0)
//!
//! Returns every problem found, not just the first.

use std::net::SocketAddr;

use crate::config::schema::{CodecConfig, ConnectionConfig, Settings};
use crate::protocol::codec::tag_at;

/// A single semantic problem in the configuration.
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

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a whole settings tree.
pub fn validate_config(settings: &Settings) -> Result<(), Vec<ValidationError>> {
    let mut errors = validate_codec(&settings.codec);
    errors.extend(validate_connection(&settings.connection));

    if settings.server.worker_pool_size == 0 {
        errors.push(ValidationError::new("server.worker_pool_size", "must be greater than 0"));
    }

    let observability = &settings.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
        ));
    }

    collect(errors)
}

/// Turn collected problems into a result.
pub fn collect(errors: Vec<ValidationError>) -> Result<(), Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Range checks for one connection's session settings.
pub fn validate_connection(connection: &ConnectionConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if connection.ttl_secs == 0 {
        errors.push(ValidationError::new("connection.ttl_secs", "must be greater than 0"));
    }
    if connection.cycle_delay_ms == 0 {
        errors.push(ValidationError::new("connection.cycle_delay_ms", "must be greater than 0"));
    }
    if connection.max_frame_bytes == 0 {
        errors.push(ValidationError::new("connection.max_frame_bytes", "must be greater than 0"));
    }
    errors
}

/// Check that every control token and every tagged payload classify apart.
pub fn validate_codec(codec: &CodecConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if codec.data_tag.is_empty() {
        errors.push(ValidationError::new("codec.data_tag", "must not be empty"));
        return errors;
    }

    let tokens = [
        ("codec.ping", &codec.ping),
        ("codec.hello", &codec.hello),
        ("codec.server_ready", &codec.server_ready),
    ];

    for (i, &(field, token)) in tokens.iter().enumerate() {
        for &(other_field, other) in &tokens[i + 1..] {
            if token == other {
                errors.push(ValidationError::new(field, format!("must differ from {}", other_field)));
            }
        }
        if tag_at(token, &codec.data_tag, codec.data_tag_offset).is_some() {
            errors.push(ValidationError::new(
                field,
                format!(
                    "carries the data tag at offset {} and would be read as data",
                    codec.data_tag_offset
                ),
            ));
        }
    }

    errors
}
