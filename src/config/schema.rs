//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files, and
//! every section has defaults so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::observability::metrics::{DEFAULT_BUCKETS, DEFAULT_MAX_SERIES_PER_METRIC};

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Log output settings.
    pub logging: LoggingConfig,

    /// Metric registry settings.
    pub metrics: MetricsConfig,

    /// Span sampling, propagation and export.
    pub tracing: TracingConfig,

    /// Simulated latency and failure injection.
    pub simulation: SimulationConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8000").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8000".to_string(),
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Whole-request timeout in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, for development.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Metric registry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Upper bounds, in seconds, of the request duration histogram.
    pub histogram_buckets: Vec<f64>,

    /// Label sets allowed per metric name before folding into `__overflow__`.
    pub max_series_per_metric: usize,

    /// Route templates that are served but not measured. Empty by default,
    /// so scrapes of `/metrics` are counted like any other request.
    pub excluded_routes: Vec<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_buckets: DEFAULT_BUCKETS.to_vec(),
            max_series_per_metric: DEFAULT_MAX_SERIES_PER_METRIC,
            excluded_routes: Vec::new(),
        }
    }
}

/// Where closed spans go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    /// OTLP/HTTP JSON to the collector.
    #[default]
    Otlp,
    /// Structured log events.
    Log,
    /// Discard.
    None,
}

/// Root sampling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    #[default]
    AlwaysOn,
    AlwaysOff,
    /// Sample `sampling_ratio` of new traces.
    Ratio,
}

/// Trace context header format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum PropagatorKind {
    /// W3C `traceparent` / `tracestate`.
    #[serde(rename = "tracecontext")]
    TraceContext,
    /// Zipkin `b3`.
    #[serde(rename = "b3")]
    B3,
}

/// Tracing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    /// When false, spans are still created for context propagation but never exported.
    pub enabled: bool,

    /// `service.name` resource attribute.
    pub service_name: String,

    pub exporter: ExporterKind,

    /// Collector base URL; spans are posted to `{collector_endpoint}/v1/traces`.
    pub collector_endpoint: String,

    pub sampler: SamplerKind,

    /// Fraction of new traces sampled when `sampler = "ratio"`.
    pub sampling_ratio: f64,

    /// Inbound formats in priority order; every one is injected outbound.
    pub propagators: Vec<PropagatorKind>,

    /// Spans per export call.
    pub max_batch_size: usize,

    /// Spans buffered before new ones are dropped.
    pub max_queue_size: usize,

    /// Maximum time a span waits in a partial batch.
    pub flush_interval_ms: u64,

    /// Bound on a single export call, and on the final flush at shutdown.
    pub export_timeout_ms: u64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "telemetry-demo".to_string(),
            exporter: ExporterKind::Otlp,
            collector_endpoint: "http://localhost:4318".to_string(),
            sampler: SamplerKind::AlwaysOn,
            sampling_ratio: 1.0,
            propagators: vec![PropagatorKind::TraceContext, PropagatorKind::B3],
            max_batch_size: 512,
            max_queue_size: 2048,
            flush_interval_ms: 5000,
            export_timeout_ms: 10_000,
        }
    }
}

/// Inclusive latency range in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct LatencyRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl LatencyRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }
}

/// Simulated business logic.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Fixed seed for latency and failure draws. Random when absent.
    pub seed: Option<u64>,

    /// Probability that `/api/simulate-error` fails.
    pub error_rate: f64,

    pub user_lookup_latency_ms: LatencyRange,

    /// Split between the validate and insert steps.
    pub user_create_latency_ms: LatencyRange,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            error_rate: 0.3,
            user_lookup_latency_ms: LatencyRange::new(100, 500),
            user_create_latency_ms: LatencyRange::new(200, 800),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: ServiceConfig = toml::from_str("").unwrap();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8000");
        assert_eq!(config.tracing.exporter, ExporterKind::Otlp);
        assert!(config.metrics.excluded_routes.is_empty());
        assert_eq!(config.simulation.error_rate, 0.3);
    }

    #[test]
    fn test_partial_sections() {
        let config: ServiceConfig = toml::from_str(
            r#"
            [logging]
            format = "json"

            [tracing]
            exporter = "log"
            sampler = "ratio"
            sampling_ratio = 0.25
            propagators = ["b3", "tracecontext"]

            [simulation]
            seed = 7
            user_lookup_latency_ms = { min_ms = 0, max_ms = 0 }
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.tracing.sampler, SamplerKind::Ratio);
        assert_eq!(
            config.tracing.propagators,
            vec![PropagatorKind::B3, PropagatorKind::TraceContext]
        );
        assert_eq!(config.tracing.max_batch_size, 512);
        assert_eq!(config.simulation.seed, Some(7));
        assert_eq!(config.simulation.user_lookup_latency_ms, LatencyRange::new(0, 0));
        assert_eq!(config.simulation.user_create_latency_ms, LatencyRange::new(200, 800));
    }
}
