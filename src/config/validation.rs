//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, low ≤ high watermarks, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: TransportConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{RateThreshold, TransportConfig, WatermarkConfig};

/// A single semantic problem in a configuration.
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

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check every semantic rule, collecting all violations.
pub fn validate_config(config: &TransportConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("`{}` is not a socket address", listener.bind_address),
        ));
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be > 0"));
    }
    if listener.read_buffer_size == 0 {
        errors.push(ValidationError::new("listener.read_buffer_size", "must be > 0"));
    }
    if listener.accept_backoff_base_ms > listener.accept_backoff_max_ms {
        errors.push(ValidationError::new(
            "listener.accept_backoff_base_ms",
            "must not exceed accept_backoff_max_ms",
        ));
    }

    if config.pipe.segment_size == 0 {
        errors.push(ValidationError::new("pipe.segment_size", "must be > 0"));
    }
    check_watermarks("pipe.input", &config.pipe.input, &mut errors);
    check_watermarks("pipe.output", &config.pipe.output, &mut errors);

    if config.pool.segment_capacity == 0 {
        errors.push(ValidationError::new("pool.segment_capacity", "must be > 0"));
    }

    let rate = &config.min_data_rate;
    if rate.heartbeat_interval_ms == 0 {
        errors.push(ValidationError::new(
            "min_data_rate.heartbeat_interval_ms",
            "must be > 0",
        ));
    }
    for (field, threshold) in [
        ("min_data_rate.request_head", &rate.request_head),
        ("min_data_rate.request_body", &rate.request_body),
        ("min_data_rate.response_body", &rate.response_body),
    ] {
        if let Some(threshold) = threshold {
            check_threshold(field, threshold, &mut errors);
        }
    }

    if config.shutdown.close_timeout_secs == 0 {
        errors.push(ValidationError::new("shutdown.close_timeout_secs", "must be > 0"));
    }
    if config.shutdown.abort_timeout_secs == 0 {
        errors.push(ValidationError::new("shutdown.abort_timeout_secs", "must be > 0"));
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("`{}` is not a socket address", observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_watermarks(prefix: &str, marks: &WatermarkConfig, errors: &mut Vec<ValidationError>) {
    if marks.low_watermark > marks.high_watermark {
        errors.push(ValidationError::new(
            format!("{prefix}.low_watermark"),
            "must not exceed high_watermark",
        ));
    } else if marks.high_watermark > 0 && marks.low_watermark == 0 {
        errors.push(ValidationError::new(
            format!("{prefix}.low_watermark"),
            "must be > 0 when high_watermark is set",
        ));
    }
}

fn check_threshold(prefix: &str, threshold: &RateThreshold, errors: &mut Vec<ValidationError>) {
    if !threshold.bytes_per_second.is_finite() || threshold.bytes_per_second <= 0.0 {
        errors.push(ValidationError::new(
            format!("{prefix}.bytes_per_second"),
            "must be a positive number",
        ));
    }
}
