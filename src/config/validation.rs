//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (frame size, log level)
//! - Check destination overrides parse and are not duplicated
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use crate::config::schema::TransportConfig;
use crate::net::Destination;

/// Smallest frame size that still fits a request head.
const MIN_FRAME_SIZE: usize = 1024;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
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

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a parsed configuration.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.codec.max_frame_size < MIN_FRAME_SIZE {
        errors.push(ValidationError::new(
            "codec.max_frame_size",
            format!("must be at least {} bytes", MIN_FRAME_SIZE),
        ));
    }
    if config.codec.max_frame_size > u32::MAX as usize {
        errors.push(ValidationError::new(
            "codec.max_frame_size",
            "must fit in a 32-bit length prefix",
        ));
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level '{}'", config.observability.log_level),
        ));
    }

    let mut seen = HashSet::new();
    for (i, destination) in config.destinations.iter().enumerate() {
        let field = format!("destinations[{}].address", i);
        match destination.address.parse::<Destination>() {
            Ok(parsed) => {
                if !seen.insert(parsed.to_string()) {
                    errors.push(ValidationError::new(
                        field,
                        format!("duplicate destination '{}'", destination.address),
                    ));
                }
            }
            Err(e) => errors.push(ValidationError::new(field, e)),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
