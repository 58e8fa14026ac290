//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ratios, sizes, latency ranges, histogram bounds)
//! - Check that addresses and URLs parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServiceConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{LatencyRange, ServiceConfig};

/// One rejected setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the setting, e.g. `tracing.sampling_ratio`.
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

/// Check every semantic rule and report all violations together.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("`{}` is not a socket address", config.listener.bind_address),
        ));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }

    validate_buckets(&config.metrics.histogram_buckets, &mut errors);
    if config.metrics.max_series_per_metric == 0 {
        errors.push(ValidationError::new(
            "metrics.max_series_per_metric",
            "must be greater than 0",
        ));
    }
    for route in &config.metrics.excluded_routes {
        if !route.starts_with('/') {
            errors.push(ValidationError::new(
                "metrics.excluded_routes",
                format!("`{}` must start with '/'", route),
            ));
        }
    }

    let tracing = &config.tracing;
    if tracing.service_name.trim().is_empty() {
        errors.push(ValidationError::new("tracing.service_name", "must not be empty"));
    }
    match Url::parse(&tracing.collector_endpoint) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        _ => errors.push(ValidationError::new(
            "tracing.collector_endpoint",
            format!("`{}` is not an http(s) URL", tracing.collector_endpoint),
        )),
    }
    if !(0.0..=1.0).contains(&tracing.sampling_ratio) {
        errors.push(ValidationError::new("tracing.sampling_ratio", "must be within [0, 1]"));
    }
    if tracing.propagators.is_empty() {
        errors.push(ValidationError::new("tracing.propagators", "must name at least one format"));
    }
    if tracing.max_batch_size == 0 {
        errors.push(ValidationError::new("tracing.max_batch_size", "must be greater than 0"));
    }
    if tracing.max_queue_size == 0 {
        errors.push(ValidationError::new("tracing.max_queue_size", "must be greater than 0"));
    }
    if tracing.max_batch_size > tracing.max_queue_size {
        errors.push(ValidationError::new(
            "tracing.max_batch_size",
            "must not exceed tracing.max_queue_size",
        ));
    }
    if tracing.flush_interval_ms == 0 {
        errors.push(ValidationError::new("tracing.flush_interval_ms", "must be greater than 0"));
    }
    if tracing.export_timeout_ms == 0 {
        errors.push(ValidationError::new("tracing.export_timeout_ms", "must be greater than 0"));
    }

    let simulation = &config.simulation;
    if !(0.0..=1.0).contains(&simulation.error_rate) {
        errors.push(ValidationError::new("simulation.error_rate", "must be within [0, 1]"));
    }
    validate_range(
        "simulation.user_lookup_latency_ms",
        simulation.user_lookup_latency_ms,
        &mut errors,
    );
    validate_range(
        "simulation.user_create_latency_ms",
        simulation.user_create_latency_ms,
        &mut errors,
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_buckets(buckets: &[f64], errors: &mut Vec<ValidationError>) {
    const FIELD: &str = "metrics.histogram_buckets";

    if buckets.is_empty() {
        errors.push(ValidationError::new(FIELD, "must not be empty"));
        return;
    }
    if buckets.iter().any(|b| !b.is_finite()) {
        errors.push(ValidationError::new(FIELD, "bounds must be finite (+Inf is implicit)"));
        return;
    }
    if buckets.windows(2).any(|w| w[0] >= w[1]) {
        errors.push(ValidationError::new(FIELD, "bounds must be strictly increasing"));
    }
}

fn validate_range(field: &str, range: LatencyRange, errors: &mut Vec<ValidationError>) {
    if range.min_ms > range.max_ms {
        errors.push(ValidationError::new(
            field,
            format!("min_ms ({}) exceeds max_ms ({})", range.min_ms, range.max_ms),
        ));
    }
}
