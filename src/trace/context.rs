//! Span context: the identity of a span as seen by other spans and services.
//!
//! A [`SpanContext`] is a plain value. It is handed to every function that
//! may open a child span or make an outbound call, instead of living in
//! thread-local or task-local storage.

use super::span::{SpanId, TraceId};

/// W3C trace flags. Only the sampled bit is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// Sampled flag.
    pub const SAMPLED: Self = Self(0x01);

    /// Wrap a raw flags byte.
    pub fn new(flags: u8) -> Self {
        Self(flags)
    }

    /// Flags for a sampling decision.
    pub fn sampled(sampled: bool) -> Self {
        if sampled {
            Self::SAMPLED
        } else {
            Self::NONE
        }
    }

    pub fn is_sampled(&self) -> bool {
        (self.0 & 0x01) != 0
    }

    /// Raw flags byte.
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Two lowercase hex characters.
    pub fn to_hex(&self) -> String {
        format!("{:02x}", self.0)
    }

    /// Parse exactly two hex characters.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u8::from_str_radix(hex, 16).ok().map(Self)
    }
}

/// Vendor entries carried in the W3C `tracestate` header.
///
/// Entries are kept in header order and forwarded untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceState {
    entries: Vec<(String, String)>,
}

impl TraceState {
    /// The W3C limit on list members.
    pub const MAX_ENTRIES: usize = 32;

    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `tracestate` header value. Malformed members are skipped.
    pub fn from_header(header: &str) -> Self {
        let entries = header
            .split(',')
            .filter_map(|member| {
                let (key, value) = member.trim().split_once('=')?;
                let (key, value) = (key.trim(), value.trim());
                (!key.is_empty() && !value.is_empty()).then(|| (key.to_string(), value.to_string()))
            })
            .take(Self::MAX_ENTRIES)
            .collect();

        Self { entries }
    }

    /// Render back to a header value.
    pub fn to_header(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Identity of one span within one trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    /// Trace this span belongs to.
    pub trace_id: TraceId,

    /// The span itself.
    pub span_id: SpanId,

    /// Sampling flags shared by the whole trace.
    pub trace_flags: TraceFlags,

    /// Vendor state forwarded along the trace.
    pub trace_state: TraceState,

    /// True when the context was extracted from an inbound request.
    pub is_remote: bool,
}

impl SpanContext {
    /// A local, sampled context.
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self {
            trace_id,
            span_id,
            trace_flags: TraceFlags::SAMPLED,
            trace_state: TraceState::new(),
            is_remote: false,
        }
    }

    /// A context that links to nothing. Spans begun under it start a new trace.
    pub fn invalid() -> Self {
        Self {
            trace_id: TraceId::INVALID,
            span_id: SpanId::INVALID,
            trace_flags: TraceFlags::NONE,
            trace_state: TraceState::new(),
            is_remote: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }

    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }

    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.trace_flags = TraceFlags::sampled(sampled);
        self
    }

    pub fn with_remote(mut self, remote: bool) -> Self {
        self.is_remote = remote;
        self
    }

    pub fn with_trace_state(mut self, trace_state: TraceState) -> Self {
        self.trace_state = trace_state;
        self
    }
}

impl Default for SpanContext {
    fn default() -> Self {
        Self::invalid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_flags() {
        assert!(!TraceFlags::NONE.is_sampled());
        assert!(TraceFlags::SAMPLED.is_sampled());
        assert!(TraceFlags::new(0x03).is_sampled());
        assert_eq!(TraceFlags::SAMPLED.to_hex(), "01");
        assert_eq!(TraceFlags::from_hex("01"), Some(TraceFlags::SAMPLED));
        assert_eq!(TraceFlags::from_hex("1"), None);
        assert_eq!(TraceFlags::from_hex("+1"), None);
    }

    #[test]
    fn test_trace_state_skips_malformed_members() {
        let state = TraceState::from_header("congo=t61rcWkgMzE, broken, =x, rojo=00f067aa0ba902b7");
        assert_eq!(state.len(), 2);
        assert_eq!(state.get("congo"), Some("t61rcWkgMzE"));
        assert_eq!(state.get("rojo"), Some("00f067aa0ba902b7"));
        assert_eq!(state.to_header(), "congo=t61rcWkgMzE,rojo=00f067aa0ba902b7");
    }

    #[test]
    fn test_trace_state_caps_entries() {
        let header = (0..40)
            .map(|i| format!("k{}=v{}", i, i))
            .collect::<Vec<_>>()
            .join(",");
        assert_eq!(TraceState::from_header(&header).len(), TraceState::MAX_ENTRIES);
    }

    #[test]
    fn test_span_context_validity() {
        let ctx = SpanContext::new(TraceId::generate(), SpanId::generate());
        assert!(ctx.is_valid());
        assert!(ctx.is_sampled());
        assert!(!ctx.is_remote);

        assert!(!SpanContext::invalid().is_valid());
        assert!(!SpanContext::default().is_sampled());
    }
}
