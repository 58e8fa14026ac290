//! Span identity, span records, and the open-span handle.
//!
//! # Responsibilities
//! - Generate trace and span identifiers
//! - Hold the mutable state of an open span ([`ActiveSpan`])
//! - Hand closed spans to the export queue ([`SpanSink`])
//!
//! # Design Decisions
//! - An [`ActiveSpan`] is owned by exactly one operation; only it mutates the span
//! - Closing is idempotent and also happens on drop, so no exit path leaks an open span
//! - A dropped span that was never ended is closed as an error and tagged with
//!   `span.abandoned` (`cancelled` or `panicked`)
//! - Unsampled spans are never queued

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc::{self, error::TrySendError};

use super::context::{SpanContext, TraceFlags, TraceState};
use super::error::{TraceError, TraceResult};
use crate::observability::metrics::{MetricsRecorder, SPAN_EXPORT_TOTAL};

/// 128-bit trace identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// The all-zero id, never emitted.
    pub const INVALID: Self = Self(0);

    /// Random non-zero id.
    pub fn generate() -> Self {
        loop {
            let id: u128 = rand::random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn from_u128(id: u128) -> Self {
        Self(id)
    }

    pub fn to_u128(&self) -> u128 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Parse 32 hex characters. The all-zero id is rejected.
    pub fn from_hex(hex: &str) -> TraceResult<Self> {
        if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TraceError::InvalidTraceId(format!(
                "expected 32 hex chars, got `{}`",
                hex
            )));
        }
        let id = u128::from_str_radix(hex, 16)
            .map_err(|e| TraceError::InvalidTraceId(e.to_string()))?;
        if id == 0 {
            return Err(TraceError::InvalidTraceId("all-zero trace id".to_string()));
        }
        Ok(Self(id))
    }

    /// 32 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.to_hex())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 64-bit span identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// The all-zero id, never emitted.
    pub const INVALID: Self = Self(0);

    /// Random non-zero id.
    pub fn generate() -> Self {
        loop {
            let id: u64 = rand::random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub fn to_u64(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Parse 16 hex characters. The all-zero id is rejected.
    pub fn from_hex(hex: &str) -> TraceResult<Self> {
        if hex.len() != 16 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TraceError::InvalidSpanId(format!(
                "expected 16 hex chars, got `{}`",
                hex
            )));
        }
        let id =
            u64::from_str_radix(hex, 16).map_err(|e| TraceError::InvalidSpanId(e.to_string()))?;
        if id == 0 {
            return Err(TraceError::InvalidSpanId("all-zero span id".to_string()));
        }
        Ok(Self(id))
    }

    /// 16 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.to_hex())
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Role of the span in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanKind {
    /// Work inside this process.
    #[default]
    Internal,
    /// Handling of an inbound request.
    Server,
    /// An outbound call.
    Client,
}

/// Span outcome. `Unset` only while the span is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u64> for AttributeValue {
    fn from(i: u64) -> Self {
        Self::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<u16> for AttributeValue {
    fn from(i: u16) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// A single span attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValue {
    pub key: String,
    pub value: AttributeValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A span record. Complete once `end_time` is set.
#[derive(Debug, Clone)]
pub struct SpanData {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    /// Absent for a locally originated root span.
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub status: SpanStatus,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl SpanData {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Wall-clock duration, once closed.
    pub fn duration(&self) -> Option<Duration> {
        self.end_time
            .map(|end| end.duration_since(self.start_time).unwrap_or_default())
    }
}

/// Entry point of the export queue.
///
/// Submitting never blocks: when the queue is full the span is dropped and
/// counted under `trace_export_spans_total{outcome="dropped"}`.
#[derive(Clone, Default)]
pub struct SpanSink {
    queue: Option<(mpsc::Sender<SpanData>, MetricsRecorder)>,
}

impl SpanSink {
    /// A bounded queue and the receiving end for the batch processor.
    pub fn bounded(capacity: usize, recorder: MetricsRecorder) -> (Self, mpsc::Receiver<SpanData>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                queue: Some((tx, recorder)),
            },
            rx,
        )
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    /// Queue a closed span for export.
    pub fn submit(&self, span: SpanData) {
        let Some((tx, recorder)) = &self.queue else {
            return;
        };

        match tx.try_send(span) {
            Ok(()) => {}
            Err(TrySendError::Full(span)) => {
                recorder.increment_counter(SPAN_EXPORT_TOTAL, &[("outcome", "dropped")]);
                tracing::debug!(span = %span.name, trace_id = %span.trace_id, "Span queue full, dropping span");
            }
            Err(TrySendError::Closed(span)) => {
                recorder.increment_counter(SPAN_EXPORT_TOTAL, &[("outcome", "dropped")]);
                tracing::debug!(span = %span.name, "Span processor stopped, dropping span");
            }
        }
    }
}

/// Handle to an open span.
///
/// Call [`ActiveSpan::end`] on the normal path. Dropping without ending
/// closes the span as an error, which is what happens when the owning future
/// is cancelled or the thread panics.
pub struct ActiveSpan {
    context: SpanContext,
    data: Option<SpanData>,
    sink: SpanSink,
}

impl ActiveSpan {
    pub(crate) fn start(
        context: SpanContext,
        parent_span_id: Option<SpanId>,
        name: String,
        kind: SpanKind,
        sink: SpanSink,
    ) -> Self {
        let data = SpanData {
            trace_id: context.trace_id,
            span_id: context.span_id,
            parent_span_id,
            name,
            kind,
            start_time: SystemTime::now(),
            end_time: None,
            status: SpanStatus::Unset,
            attributes: BTreeMap::new(),
        };

        Self {
            context,
            data: Some(data),
            sink,
        }
    }

    /// Context to hand to children and outbound calls.
    pub fn context(&self) -> SpanContext {
        self.context.clone()
    }

    pub fn trace_id(&self) -> TraceId {
        self.context.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.context.span_id
    }

    pub fn is_sampled(&self) -> bool {
        self.context.is_sampled()
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        if let Some(data) = self.data.as_mut() {
            data.attributes.insert(key.into(), value.into());
        }
    }

    pub fn set_status(&mut self, status: SpanStatus) {
        if let Some(data) = self.data.as_mut() {
            data.status = status;
        }
    }

    /// Mark the span failed and describe why.
    pub fn record_error(&mut self, description: impl fmt::Display) {
        if let Some(data) = self.data.as_mut() {
            data.status = SpanStatus::Error;
            data.attributes.insert(
                "error.message".to_string(),
                AttributeValue::String(description.to_string()),
            );
        }
    }

    /// Close the span. An unset status becomes `Ok`.
    pub fn end(mut self) {
        self.close(None);
    }

    fn close(&mut self, abandoned: Option<&'static str>) {
        let Some(mut data) = self.data.take() else {
            return;
        };

        if let Some(reason) = abandoned {
            data.status = SpanStatus::Error;
            data.attributes
                .insert("span.abandoned".to_string(), AttributeValue::from(reason));
        } else if data.status == SpanStatus::Unset {
            data.status = SpanStatus::Ok;
        }
        data.end_time = Some(SystemTime::now());

        if self.context.is_sampled() {
            self.sink.submit(data);
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if self.data.is_some() {
            let reason = if std::thread::panicking() {
                "panicked"
            } else {
                "cancelled"
            };
            self.close(Some(reason));
        }
    }
}

impl fmt::Debug for ActiveSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSpan")
            .field("trace_id", &self.context.trace_id)
            .field("span_id", &self.context.span_id)
            .field("open", &self.data.is_some())
            .finish()
    }
}

/// Root context for a new trace with the given sampling decision.
pub(crate) fn new_root_context(sampled: bool, trace_state: TraceState) -> SpanContext {
    SpanContext {
        trace_id: TraceId::generate(),
        span_id: SpanId::generate(),
        trace_flags: TraceFlags::sampled(sampled),
        trace_state,
        is_remote: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_span(sampled: bool) -> (ActiveSpan, mpsc::Receiver<SpanData>) {
        let (sink, rx) = SpanSink::bounded(8, MetricsRecorder::new());
        let context = new_root_context(sampled, TraceState::new());
        let span = ActiveSpan::start(context, None, "work".to_string(), SpanKind::Internal, sink);
        (span, rx)
    }

    #[test]
    fn test_ids_are_valid_and_distinct() {
        let a = TraceId::generate();
        let b = TraceId::generate();
        assert!(a.is_valid());
        assert_ne!(a, b);
        assert!(SpanId::generate().is_valid());
    }

    #[test]
    fn test_hex_parsing() {
        let id = TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
        assert_eq!(id.to_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert!(TraceId::from_hex("00000000000000000000000000000000").is_err());
        assert!(TraceId::from_hex("4bf92f3577b34da6").is_err());
        assert!(TraceId::from_hex("+bf92f3577b34da6a3ce929d0e0e4736").is_err());

        let span = SpanId::from_hex("00f067aa0ba902b7").unwrap();
        assert_eq!(span.to_hex(), "00f067aa0ba902b7");
        assert!(SpanId::from_hex("0000000000000000").is_err());
    }

    #[test]
    fn test_end_sets_ok_and_queues() {
        let (mut span, mut rx) = open_span(true);
        span.set_attribute("user.id", 42i64);
        span.end();

        let data = rx.try_recv().unwrap();
        assert_eq!(data.status, SpanStatus::Ok);
        assert!(data.end_time.is_some());
        assert_eq!(data.attribute("user.id"), Some(&AttributeValue::Int(42)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_record_error() {
        let (mut span, mut rx) = open_span(true);
        span.record_error("connection reset");
        span.end();

        let data = rx.try_recv().unwrap();
        assert_eq!(data.status, SpanStatus::Error);
        assert_eq!(
            data.attribute("error.message"),
            Some(&AttributeValue::from("connection reset"))
        );
    }

    #[test]
    fn test_drop_without_end_closes_as_cancelled() {
        let (span, mut rx) = open_span(true);
        drop(span);

        let data = rx.try_recv().unwrap();
        assert_eq!(data.status, SpanStatus::Error);
        assert_eq!(data.attribute("span.abandoned"), Some(&AttributeValue::from("cancelled")));
        assert!(data.end_time.is_some());
    }

    #[test]
    fn test_unsampled_span_is_not_queued() {
        let (span, mut rx) = open_span(false);
        span.end();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_counts_drop() {
        let recorder = MetricsRecorder::new();
        let (sink, _rx) = SpanSink::bounded(1, recorder.clone());
        for _ in 0..3 {
            let span = ActiveSpan::start(
                new_root_context(true, TraceState::new()),
                None,
                "burst".to_string(),
                SpanKind::Internal,
                sink.clone(),
            );
            span.end();
        }
        assert_eq!(
            recorder.counter_value(SPAN_EXPORT_TOTAL, &[("outcome", "dropped")]),
            Some(2)
        );
    }
}
