//! Span exporters.
//!
//! # Responsibilities
//! - Ship batches of closed spans to a trace collector (OTLP/HTTP JSON)
//! - Offer local sinks for development (`log`) and tests (in-memory)
//!
//! # Design Decisions
//! - Exporters are best-effort: a failed batch is reported to the caller and
//!   never retried, the batch processor decides what to do with it
//! - The OTLP payload is hand-encoded with serde; the collector only needs
//!   the JSON protobuf mapping, not a full SDK

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use url::Url;

use super::error::{TraceError, TraceResult};
use super::span::{AttributeValue, SpanData, SpanKind, SpanStatus};
use crate::config::schema::{ExporterKind, TracingConfig};

/// Destination for closed spans.
pub trait SpanExporter: Send + Sync + 'static {
    /// Export one batch.
    fn export(&self, spans: &[SpanData]) -> impl Future<Output = TraceResult<()>> + Send;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Discards every span.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

impl SpanExporter for NoopExporter {
    async fn export(&self, _spans: &[SpanData]) -> TraceResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Writes each span as a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogExporter;

impl SpanExporter for LogExporter {
    async fn export(&self, spans: &[SpanData]) -> TraceResult<()> {
        for span in spans {
            let duration_ms = span
                .duration()
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or_default();
            let attributes = span
                .attributes
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" ");

            tracing::info!(
                target: "telemetry_demo::spans",
                trace_id = %span.trace_id,
                span_id = %span.span_id,
                parent_span_id = %span.parent_span_id.map(|id| id.to_hex()).unwrap_or_default(),
                kind = ?span.kind,
                status = ?span.status,
                duration_ms,
                attributes = %attributes,
                "{}",
                span.name
            );
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Keeps exported spans in memory. Clones share storage.
#[derive(Debug, Default, Clone)]
pub struct InMemoryExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every span exported so far, in export order.
    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.spans.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut spans) = self.spans.lock() {
            spans.clear();
        }
    }
}

impl SpanExporter for InMemoryExporter {
    async fn export(&self, spans: &[SpanData]) -> TraceResult<()> {
        let mut stored = self
            .spans
            .lock()
            .map_err(|_| TraceError::Export("span store lock poisoned".to_string()))?;
        stored.extend_from_slice(spans);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// OTLP over HTTP with JSON encoding, posted to `{endpoint}/v1/traces`.
#[derive(Debug, Clone)]
pub struct OtlpHttpExporter {
    client: reqwest::Client,
    url: Url,
    service_name: String,
}

impl OtlpHttpExporter {
    pub const TRACES_PATH: [&'static str; 2] = ["v1", "traces"];

    pub fn new(
        collector_endpoint: &str,
        service_name: impl Into<String>,
        timeout: Duration,
    ) -> TraceResult<Self> {
        let url = traces_url(collector_endpoint)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url,
            service_name: service_name.into(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl SpanExporter for OtlpHttpExporter {
    async fn export(&self, spans: &[SpanData]) -> TraceResult<()> {
        if spans.is_empty() {
            return Ok(());
        }

        let payload = encode_otlp(&self.service_name, spans);
        let response = self.client.post(self.url.clone()).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TraceError::Export(format!("collector responded {}", status)));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "otlp"
    }
}

fn traces_url(collector_endpoint: &str) -> TraceResult<Url> {
    let mut url = Url::parse(collector_endpoint)
        .map_err(|e| TraceError::Export(format!("invalid collector endpoint: {}", e)))?;

    if url.path().trim_end_matches('/').ends_with("/v1/traces") {
        return Ok(url);
    }

    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| TraceError::Export("collector endpoint cannot be a base".to_string()))?;
        segments.pop_if_empty().extend(OtlpHttpExporter::TRACES_PATH);
    }
    Ok(url)
}

/// Exporter selected by configuration.
#[derive(Debug, Clone)]
pub enum Exporter {
    Otlp(OtlpHttpExporter),
    Log(LogExporter),
    InMemory(InMemoryExporter),
    Noop(NoopExporter),
}

impl Exporter {
    /// Build the configured exporter. A collector that cannot be set up
    /// degrades to [`NoopExporter`] so the service still starts.
    pub fn from_config(config: &TracingConfig) -> Self {
        match config.exporter {
            ExporterKind::Otlp => {
                let timeout = Duration::from_millis(config.export_timeout_ms);
                match OtlpHttpExporter::new(&config.collector_endpoint, &config.service_name, timeout)
                {
                    Ok(exporter) => {
                        tracing::info!(url = %exporter.url(), "Exporting spans over OTLP/HTTP");
                        Self::Otlp(exporter)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Cannot set up OTLP exporter, spans will be discarded");
                        Self::Noop(NoopExporter)
                    }
                }
            }
            ExporterKind::Log => Self::Log(LogExporter),
            ExporterKind::None => Self::Noop(NoopExporter),
        }
    }
}

impl SpanExporter for Exporter {
    async fn export(&self, spans: &[SpanData]) -> TraceResult<()> {
        match self {
            Self::Otlp(e) => e.export(spans).await,
            Self::Log(e) => e.export(spans).await,
            Self::InMemory(e) => e.export(spans).await,
            Self::Noop(e) => e.export(spans).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Otlp(e) => e.name(),
            Self::Log(e) => e.name(),
            Self::InMemory(e) => e.name(),
            Self::Noop(e) => e.name(),
        }
    }
}

// OTLP/JSON wire types. 64-bit integers are encoded as strings.

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTraceRequest {
    resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResourceSpans {
    resource: Resource,
    scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Serialize)]
struct Resource {
    attributes: Vec<OtlpAttribute>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScopeSpans {
    scope: Scope,
    spans: Vec<OtlpSpan>,
}

#[derive(Debug, Serialize)]
struct Scope {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OtlpSpan {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: String,
    kind: u8,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    attributes: Vec<OtlpAttribute>,
    status: OtlpStatus,
}

#[derive(Debug, Serialize)]
struct OtlpAttribute {
    key: String,
    value: OtlpValue,
}

#[derive(Debug, Serialize)]
enum OtlpValue {
    #[serde(rename = "stringValue")]
    String(String),
    #[serde(rename = "boolValue")]
    Bool(bool),
    #[serde(rename = "intValue")]
    Int(String),
    #[serde(rename = "doubleValue")]
    Double(f64),
}

#[derive(Debug, Serialize)]
struct OtlpStatus {
    code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<&AttributeValue> for OtlpValue {
    fn from(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::String(s) => Self::String(s.clone()),
            AttributeValue::Bool(b) => Self::Bool(*b),
            AttributeValue::Int(i) => Self::Int(i.to_string()),
            AttributeValue::Float(f) => Self::Double(*f),
        }
    }
}

impl From<&SpanData> for OtlpSpan {
    fn from(span: &SpanData) -> Self {
        let kind = match span.kind {
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
        };
        let status = match span.status {
            SpanStatus::Unset => OtlpStatus { code: 0, message: None },
            SpanStatus::Ok => OtlpStatus { code: 1, message: None },
            SpanStatus::Error => OtlpStatus {
                code: 2,
                message: span.attribute("error.message").map(|v| v.to_string()),
            },
        };

        Self {
            trace_id: span.trace_id.to_hex(),
            span_id: span.span_id.to_hex(),
            parent_span_id: span.parent_span_id.map(|id| id.to_hex()),
            name: span.name.clone(),
            kind,
            start_time_unix_nano: unix_nanos(span.start_time),
            end_time_unix_nano: unix_nanos(span.end_time.unwrap_or(span.start_time)),
            attributes: span
                .attributes
                .iter()
                .map(|(k, v)| OtlpAttribute {
                    key: k.clone(),
                    value: v.into(),
                })
                .collect(),
            status,
        }
    }
}

fn unix_nanos(time: SystemTime) -> String {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
        .to_string()
}

/// Encode a batch as an OTLP `ExportTraceServiceRequest`.
pub fn encode_otlp(service_name: &str, spans: &[SpanData]) -> ExportTraceRequest {
    ExportTraceRequest {
        resource_spans: vec![ResourceSpans {
            resource: Resource {
                attributes: vec![OtlpAttribute {
                    key: "service.name".to_string(),
                    value: OtlpValue::String(service_name.to_string()),
                }],
            },
            scope_spans: vec![ScopeSpans {
                scope: Scope {
                    name: env!("CARGO_PKG_NAME"),
                    version: env!("CARGO_PKG_VERSION"),
                },
                spans: spans.iter().map(OtlpSpan::from).collect(),
            }],
        }],
    }
}
