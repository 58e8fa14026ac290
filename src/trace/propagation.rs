//! Trace context propagation across process boundaries.
//!
//! # Responsibilities
//! - Extract a remote [`SpanContext`] from inbound request headers
//! - Inject the current [`SpanContext`] into outbound request headers
//!
//! # Design Decisions
//! - W3C Trace Context (`traceparent`/`tracestate`) is the primary format
//! - B3 (single `b3` header, or the `X-B3-*` multi-header form) is accepted
//!   for callers instrumented with Zipkin-era libraries
//! - Malformed headers are ignored: the request simply starts a new trace

use std::collections::HashMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use super::context::{SpanContext, TraceFlags, TraceState};
use super::error::{TraceError, TraceResult};
use super::span::{SpanId, TraceId};
use crate::config::schema::PropagatorKind;

/// Read access to a header-like carrier.
pub trait Extractor {
    /// Value for a lowercase key.
    fn get(&self, key: &str) -> Option<&str>;
}

/// Write access to a header-like carrier.
pub trait Injector {
    fn set(&mut self, key: &str, value: String);
}

impl Extractor for HeaderMap {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.to_str().ok())
    }
}

impl Injector for HeaderMap {
    fn set(&mut self, key: &str, value: String) {
        let name = match HeaderName::from_bytes(key.as_bytes()) {
            Ok(name) => name,
            Err(e) => {
                tracing::debug!(key, error = %e, "Invalid header name for trace injection");
                return;
            }
        };
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                self.insert(name, value);
            }
            Err(e) => tracing::debug!(key, error = %e, "Invalid header value for trace injection"),
        }
    }
}

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        self.get(key).map(|s| s.as_str())
    }
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

/// One propagation format.
pub trait TextMapPropagator: Send + Sync {
    /// Remote context carried by `carrier`, if any.
    fn extract(&self, carrier: &dyn Extractor) -> Option<SpanContext>;

    /// Write `context` into `carrier`. Invalid contexts are not written.
    fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector);

    /// Header names this format reads and writes.
    fn fields(&self) -> &'static [&'static str];
}

/// W3C Trace Context.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceContextPropagator;

impl TraceContextPropagator {
    pub const TRACEPARENT: &'static str = "traceparent";
    pub const TRACESTATE: &'static str = "tracestate";

    pub fn new() -> Self {
        Self
    }

    /// Parse `{version}-{trace-id}-{parent-id}-{trace-flags}`.
    ///
    /// Version `00` must have exactly four fields; later versions may append
    /// fields, which are ignored.
    pub fn parse_traceparent(header: &str) -> TraceResult<SpanContext> {
        let parts: Vec<&str> = header.trim().split('-').collect();
        if parts.len() < 4 {
            return Err(TraceError::Propagation(
                "traceparent must have 4 fields".to_string(),
            ));
        }

        let version = parts[0];
        if version.len() != 2 || !version.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TraceError::Propagation(format!(
                "invalid traceparent version `{}`",
                version
            )));
        }
        if version.eq_ignore_ascii_case("ff") {
            return Err(TraceError::Propagation("forbidden traceparent version ff".to_string()));
        }
        if version == "00" && parts.len() != 4 {
            return Err(TraceError::Propagation(
                "version 00 traceparent must have exactly 4 fields".to_string(),
            ));
        }

        let trace_id = TraceId::from_hex(parts[1])?;
        let span_id = SpanId::from_hex(parts[2])?;
        let flags = TraceFlags::from_hex(parts[3])
            .ok_or_else(|| TraceError::Propagation("invalid trace flags".to_string()))?;

        Ok(SpanContext {
            trace_id,
            span_id,
            trace_flags: flags,
            trace_state: TraceState::new(),
            is_remote: true,
        })
    }

    pub fn format_traceparent(context: &SpanContext) -> String {
        format!(
            "00-{}-{}-{}",
            context.trace_id.to_hex(),
            context.span_id.to_hex(),
            context.trace_flags.to_hex()
        )
    }
}

impl TextMapPropagator for TraceContextPropagator {
    fn extract(&self, carrier: &dyn Extractor) -> Option<SpanContext> {
        let header = carrier.get(Self::TRACEPARENT)?;
        match Self::parse_traceparent(header) {
            Ok(context) => {
                let trace_state = carrier
                    .get(Self::TRACESTATE)
                    .map(TraceState::from_header)
                    .unwrap_or_default();
                Some(context.with_trace_state(trace_state))
            }
            Err(e) => {
                tracing::debug!(error = %e, header, "Ignoring malformed traceparent");
                None
            }
        }
    }

    fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector) {
        if !context.is_valid() {
            return;
        }
        carrier.set(Self::TRACEPARENT, Self::format_traceparent(context));
        if !context.trace_state.is_empty() {
            carrier.set(Self::TRACESTATE, context.trace_state.to_header());
        }
    }

    fn fields(&self) -> &'static [&'static str] {
        &[Self::TRACEPARENT, Self::TRACESTATE]
    }
}

/// Zipkin B3.
///
/// Extracts the single `b3` header, falling back to `X-B3-*` headers.
/// Injects the single-header form. A missing sampling field is treated as
/// sampled.
#[derive(Debug, Default, Clone, Copy)]
pub struct B3Propagator;

impl B3Propagator {
    pub const SINGLE: &'static str = "b3";
    pub const TRACE_ID: &'static str = "x-b3-traceid";
    pub const SPAN_ID: &'static str = "x-b3-spanid";
    pub const SAMPLED: &'static str = "x-b3-sampled";

    pub fn new() -> Self {
        Self
    }

    /// Parse `{trace-id}-{span-id}[-{sampling}[-{parent-span-id}]]`.
    pub fn parse_single(header: &str) -> TraceResult<SpanContext> {
        let parts: Vec<&str> = header.trim().split('-').collect();
        if parts.len() < 2 {
            return Err(TraceError::Propagation(
                "b3 header carries no trace identity".to_string(),
            ));
        }
        let sampled = match parts.get(2) {
            Some(flag) => parse_sampling(flag)?,
            None => true,
        };
        Self::build(parts[0], parts[1], sampled)
    }

    fn parse_multi(carrier: &dyn Extractor) -> Option<TraceResult<SpanContext>> {
        let trace_id = carrier.get(Self::TRACE_ID)?;
        let span_id = carrier.get(Self::SPAN_ID)?;
        let sampled = match carrier.get(Self::SAMPLED) {
            Some(flag) => match parse_sampling(flag) {
                Ok(sampled) => sampled,
                Err(e) => return Some(Err(e)),
            },
            None => true,
        };
        Some(Self::build(trace_id, span_id, sampled))
    }

    fn build(trace_id: &str, span_id: &str, sampled: bool) -> TraceResult<SpanContext> {
        // 64-bit trace ids are left-padded to 128 bits
        let trace_id = if trace_id.len() == 16 {
            TraceId::from_hex(&format!("{:0>32}", trace_id))?
        } else {
            TraceId::from_hex(trace_id)?
        };
        let span_id = SpanId::from_hex(span_id)?;

        Ok(SpanContext::new(trace_id, span_id)
            .with_sampled(sampled)
            .with_remote(true))
    }
}

fn parse_sampling(flag: &str) -> TraceResult<bool> {
    match flag {
        "1" | "d" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(TraceError::Propagation(format!("invalid b3 sampling state `{}`", other))),
    }
}

impl TextMapPropagator for B3Propagator {
    fn extract(&self, carrier: &dyn Extractor) -> Option<SpanContext> {
        let parsed = match carrier.get(Self::SINGLE) {
            Some(header) => Self::parse_single(header),
            None => Self::parse_multi(carrier)?,
        };
        match parsed {
            Ok(context) => Some(context),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring malformed b3 headers");
                None
            }
        }
    }

    fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector) {
        if !context.is_valid() {
            return;
        }
        let sampled = if context.is_sampled() { "1" } else { "0" };
        carrier.set(
            Self::SINGLE,
            format!("{}-{}-{}", context.trace_id.to_hex(), context.span_id.to_hex(), sampled),
        );
    }

    fn fields(&self) -> &'static [&'static str] {
        &[Self::SINGLE, Self::TRACE_ID, Self::SPAN_ID, Self::SAMPLED]
    }
}

/// Ordered list of formats. Extraction takes the first match; injection
/// writes every format.
pub struct CompositePropagator {
    propagators: Vec<Box<dyn TextMapPropagator>>,
}

impl CompositePropagator {
    pub fn new(propagators: Vec<Box<dyn TextMapPropagator>>) -> Self {
        Self { propagators }
    }

    pub fn from_config(kinds: &[PropagatorKind]) -> Self {
        let propagators = kinds
            .iter()
            .map(|kind| -> Box<dyn TextMapPropagator> {
                match kind {
                    PropagatorKind::TraceContext => Box::new(TraceContextPropagator::new()),
                    PropagatorKind::B3 => Box::new(B3Propagator::new()),
                }
            })
            .collect();
        Self::new(propagators)
    }

    pub fn extract(&self, carrier: &dyn Extractor) -> Option<SpanContext> {
        self.propagators.iter().find_map(|p| p.extract(carrier))
    }

    pub fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector) {
        for propagator in &self.propagators {
            propagator.inject(context, carrier);
        }
    }

    pub fn fields(&self) -> Vec<&'static str> {
        self.propagators
            .iter()
            .flat_map(|p| p.fields().iter().copied())
            .collect()
    }
}

impl Default for CompositePropagator {
    fn default() -> Self {
        Self::from_config(&[PropagatorKind::TraceContext, PropagatorKind::B3])
    }
}

impl std::fmt::Debug for CompositePropagator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositePropagator")
            .field("fields", &self.fields())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn carrier(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_traceparent() {
        let headers = carrier(&[("traceparent", TRACEPARENT), ("tracestate", "congo=t61rcWkgMzE")]);
        let ctx = TraceContextPropagator::new().extract(&headers).unwrap();

        assert_eq!(ctx.trace_id.to_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id.to_hex(), "00f067aa0ba902b7");
        assert!(ctx.is_sampled());
        assert!(ctx.is_remote);
        assert_eq!(ctx.trace_state.get("congo"), Some("t61rcWkgMzE"));
    }

    #[test]
    fn test_malformed_traceparent_is_ignored() {
        let propagator = TraceContextPropagator::new();
        for bad in [
            "garbage",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7",
            "ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-extra",
        ] {
            assert!(propagator.extract(&carrier(&[("traceparent", bad)])).is_none(), "{}", bad);
        }
    }

    #[test]
    fn test_future_version_allows_extra_fields() {
        let ctx = TraceContextPropagator::parse_traceparent(
            "cc-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-what-the-future-holds",
        )
        .unwrap();
        assert!(ctx.is_sampled());
    }

    #[test]
    fn test_inject_traceparent_into_header_map() {
        let ctx = TraceContextPropagator::parse_traceparent(TRACEPARENT).unwrap();
        let mut headers = HeaderMap::new();
        TraceContextPropagator::new().inject(&ctx, &mut headers);

        assert_eq!(headers.get("traceparent").unwrap(), TRACEPARENT);
        assert!(headers.get("tracestate").is_none());
    }

    #[test]
    fn test_invalid_context_is_not_injected() {
        let mut headers = HashMap::new();
        CompositePropagator::default().inject(&SpanContext::invalid(), &mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_b3_single_header() {
        let ctx = B3Propagator::parse_single("80f198ee56343ba864fe8b2a57d3eff7-e457b5a2e4d86bd1-0")
            .unwrap();
        assert_eq!(ctx.trace_id.to_hex(), "80f198ee56343ba864fe8b2a57d3eff7");
        assert!(!ctx.is_sampled());

        let short = B3Propagator::parse_single("64fe8b2a57d3eff7-e457b5a2e4d86bd1").unwrap();
        assert_eq!(short.trace_id.to_hex(), "000000000000000064fe8b2a57d3eff7");
        assert!(short.is_sampled());

        assert!(B3Propagator::parse_single("0").is_err());
    }

    #[test]
    fn test_b3_multi_header() {
        let headers = carrier(&[
            ("x-b3-traceid", "80f198ee56343ba864fe8b2a57d3eff7"),
            ("x-b3-spanid", "e457b5a2e4d86bd1"),
            ("x-b3-sampled", "1"),
        ]);
        let ctx = B3Propagator::new().extract(&headers).unwrap();
        assert_eq!(ctx.span_id.to_hex(), "e457b5a2e4d86bd1");
        assert!(ctx.is_sampled());
    }

    #[test]
    fn test_composite_prefers_first_format() {
        let headers = carrier(&[
            ("traceparent", TRACEPARENT),
            ("b3", "80f198ee56343ba864fe8b2a57d3eff7-e457b5a2e4d86bd1-1"),
        ]);
        let ctx = CompositePropagator::default().extract(&headers).unwrap();
        assert_eq!(ctx.trace_id.to_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");

        let b3_only = carrier(&[("b3", "80f198ee56343ba864fe8b2a57d3eff7-e457b5a2e4d86bd1-1")]);
        let ctx = CompositePropagator::default().extract(&b3_only).unwrap();
        assert_eq!(ctx.trace_id.to_hex(), "80f198ee56343ba864fe8b2a57d3eff7");
    }

    #[test]
    fn test_composite_injects_every_format() {
        let ctx = SpanContext::new(TraceId::generate(), SpanId::generate());
        let mut headers = HashMap::new();
        CompositePropagator::default().inject(&ctx, &mut headers);

        assert!(headers.contains_key("traceparent"));
        assert_eq!(
            headers.get("b3").map(String::as_str),
            Some(format!("{}-{}-1", ctx.trace_id, ctx.span_id).as_str())
        );
    }
}
