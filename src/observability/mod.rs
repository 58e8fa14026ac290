//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every request and simulated operation produces:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!     → crate::trace (spans with propagated trace context)
//!
//! Consumers:
//!     → stdout (pretty or JSON log lines)
//!     → GET /metrics (Prometheus scrape)
//!     → OTLP collector, e.g. Jaeger (batch span export)
//! ```
//!
//! # Design Decisions
//! - One [`Telemetry`] bundle is built at startup and shared by reference
//! - Metrics are cheap (atomic increments) and always on
//! - Tracing can be disabled; spans are then still created for propagation
//!   but never leave the process

pub mod logging;
pub mod metrics;

use std::sync::Arc;

use crate::config::schema::ServiceConfig;
use crate::trace::{
    pipeline, BatchSpanProcessor, CompositePropagator, Exporter, Sampler, SpanExporter, SpanSink,
    Tracer,
};

pub use self::metrics::{MetricKind, MetricsRecorder};

/// Handles shared by the HTTP layer and the simulated business logic.
#[derive(Clone)]
pub struct Telemetry {
    pub recorder: MetricsRecorder,
    pub tracer: Tracer,
    pub propagator: Arc<CompositePropagator>,
}

impl Telemetry {
    /// Build telemetry with the exporter named in `config`.
    ///
    /// The returned processor, if any, must be spawned.
    pub fn init(config: &ServiceConfig) -> (Self, Option<BatchSpanProcessor<Exporter>>) {
        Self::with_exporter(config, Exporter::from_config(&config.tracing))
    }

    /// Build telemetry exporting through `exporter`.
    pub fn with_exporter<E: SpanExporter>(
        config: &ServiceConfig,
        exporter: E,
    ) -> (Self, Option<BatchSpanProcessor<E>>) {
        let recorder = MetricsRecorder::with_config(&config.metrics);
        describe_metrics(&recorder);

        let propagator = Arc::new(CompositePropagator::from_config(&config.tracing.propagators));

        let (tracer, processor) = if config.tracing.enabled {
            let (tracer, processor) = pipeline(exporter, &config.tracing, recorder.clone());
            (tracer, Some(processor))
        } else {
            tracing::info!("Span export disabled");
            let tracer = Tracer::new(Sampler::from_config(&config.tracing), SpanSink::disabled());
            (tracer, None)
        };

        let telemetry = Self {
            recorder,
            tracer,
            propagator,
        };
        (telemetry, processor)
    }
}

/// Register help text for the metrics this service emits.
pub fn describe_metrics(recorder: &MetricsRecorder) {
    recorder.describe(
        metrics::REQUESTS_TOTAL,
        MetricKind::Counter,
        "Total HTTP requests by method, route template and status class",
    );
    recorder.describe(
        metrics::REQUEST_DURATION,
        MetricKind::Histogram,
        "HTTP request duration in seconds by method and route template",
    );
    recorder.describe(
        metrics::REQUESTS_IN_FLIGHT,
        MetricKind::Gauge,
        "HTTP requests currently being handled",
    );
    recorder.describe(
        metrics::SPAN_EXPORT_TOTAL,
        MetricKind::Counter,
        "Closed spans by export outcome (exported, failed, dropped)",
    );
}
