//! Span creation.
//!
//! A [`Tracer`] turns a parent [`SpanContext`] into a new [`ActiveSpan`].
//! Parents are always passed in explicitly; the tracer itself keeps no
//! notion of a "current" span.

use std::fmt;
use std::future::Future;

use super::context::{SpanContext, TraceState};
use super::sampler::Sampler;
use super::span::{new_root_context, ActiveSpan, KeyValue, SpanId, SpanKind, SpanSink};

/// Creates spans and routes closed ones to the export queue.
#[derive(Clone, Default)]
pub struct Tracer {
    sampler: Sampler,
    sink: SpanSink,
}

impl Tracer {
    pub fn new(sampler: Sampler, sink: SpanSink) -> Self {
        Self { sampler, sink }
    }

    pub fn sampler(&self) -> Sampler {
        self.sampler
    }

    /// Open the first local span of a request.
    ///
    /// With a valid `remote_parent` the span joins that trace and inherits its
    /// sampling decision; otherwise a new trace is started.
    pub fn start_root(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        remote_parent: Option<&SpanContext>,
    ) -> ActiveSpan {
        match remote_parent.filter(|p| p.is_valid()) {
            Some(parent) => self.child_of(parent, name.into(), kind),
            None => self.new_trace(name.into(), kind),
        }
    }

    /// Open an internal child of `parent` carrying `attributes`.
    ///
    /// An invalid parent starts a new trace instead.
    pub fn begin(
        &self,
        parent: &SpanContext,
        name: impl Into<String>,
        attributes: impl IntoIterator<Item = KeyValue>,
    ) -> ActiveSpan {
        let mut span = self.start_root(name, SpanKind::Internal, Some(parent));
        for kv in attributes {
            span.set_attribute(kv.key, kv.value);
        }
        span
    }

    /// Open a client span for an outbound call made on behalf of `parent`.
    pub fn begin_client(&self, parent: &SpanContext, name: impl Into<String>) -> ActiveSpan {
        self.start_root(name, SpanKind::Client, Some(parent))
    }

    /// Run `f` inside a child span of `parent`.
    ///
    /// `f` receives the child's context so it can open grandchildren. An
    /// `Err` result is recorded on the span before it closes. If the returned
    /// future is dropped early the span closes as cancelled.
    pub async fn in_span<F, Fut, T, E>(
        &self,
        parent: &SpanContext,
        name: impl Into<String>,
        attributes: impl IntoIterator<Item = KeyValue>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(SpanContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut span = self.begin(parent, name, attributes);
        let result = f(span.context()).await;
        if let Err(e) = &result {
            span.record_error(e);
        }
        span.end();
        result
    }

    fn child_of(&self, parent: &SpanContext, name: String, kind: SpanKind) -> ActiveSpan {
        let sampled = self.sampler.should_sample(Some(parent), parent.trace_id);
        let context = SpanContext::new(parent.trace_id, SpanId::generate())
            .with_sampled(sampled)
            .with_trace_state(parent.trace_state.clone());
        ActiveSpan::start(context, Some(parent.span_id), name, kind, self.sink.clone())
    }

    fn new_trace(&self, name: String, kind: SpanKind) -> ActiveSpan {
        let mut context = new_root_context(true, TraceState::new());
        let sampled = self.sampler.should_sample(None, context.trace_id);
        context = context.with_sampled(sampled);
        ActiveSpan::start(context, None, name, kind, self.sink.clone())
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("sampler", &self.sampler)
            .field("exporting", &self.sink.is_enabled())
            .finish()
    }
}
