//! Distributed tracing.
//!
//! # Responsibilities
//! - Open and close spans around units of work ([`Tracer`], [`ActiveSpan`])
//! - Carry trace context across process boundaries ([`CompositePropagator`])
//! - Batch closed spans and export them off the request path
//!   ([`BatchSpanProcessor`], [`Exporter`])
//!
//! # Design Decisions
//! - Context is an explicit [`SpanContext`] value passed to whoever opens a
//!   child span or makes an outbound call; nothing is stored in task-locals
//! - Head sampling is parent-based, so a caller's decision is honored
//! - Export is best-effort and can never fail a request

pub mod client;
pub mod context;
pub mod error;
pub mod exporter;
pub mod processor;
pub mod propagation;
pub mod sampler;
pub mod span;
pub mod tracer;

pub use client::TracedClient;
pub use context::{SpanContext, TraceFlags, TraceState};
pub use error::{TraceError, TraceResult};
pub use exporter::{Exporter, InMemoryExporter, LogExporter, NoopExporter, OtlpHttpExporter, SpanExporter};
pub use processor::{pipeline, BatchConfig, BatchSpanProcessor};
pub use propagation::{
    B3Propagator, CompositePropagator, Extractor, Injector, TextMapPropagator,
    TraceContextPropagator,
};
pub use sampler::Sampler;
pub use span::{
    ActiveSpan, AttributeValue, KeyValue, SpanData, SpanId, SpanKind, SpanSink, SpanStatus, TraceId,
};
pub use tracer::Tracer;
