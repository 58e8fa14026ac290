//! Per-request instrumentation.
//!
//! # Responsibilities
//! - Time every inbound request and label it with method, route template
//!   and status class
//! - Open the root server span, continuing an inbound trace when one is
//!   propagated
//! - Record exactly one counter increment and one histogram observation per
//!   request, whether it responds, panics or is cancelled
//!
//! # Design Decisions
//! - The core ([`RequestInterceptor`], [`InFlightRequest`]) only sees the
//!   [`InboundRequest`] trait; [`track_requests`] is the axum adapter
//! - Completion lives in `Drop`, so a dropped request future still produces
//!   its observation (as `cancelled`)
//! - Labels use the route template, never the raw path, so label
//!   cardinality is bounded by the route table

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use futures_util::FutureExt;
use serde_json::json;

use crate::http::error::ErrorDetail;
use crate::http::request::X_REQUEST_ID;
use crate::observability::metrics::{REQUESTS_IN_FLIGHT, REQUESTS_TOTAL, REQUEST_DURATION};
use crate::observability::{MetricsRecorder, Telemetry};
use crate::trace::{ActiveSpan, CompositePropagator, Extractor, SpanContext, SpanKind, SpanStatus, Tracer};

/// Route label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// What the interceptor needs to know about an inbound request.
pub trait InboundRequest {
    /// HTTP method as sent.
    fn method(&self) -> &str;

    /// Template of the matched route (`/api/users/{user_id}`), if any.
    fn route_template(&self) -> Option<&str>;

    /// Headers carrying trace context.
    fn carrier(&self) -> &dyn Extractor;

    fn request_id(&self) -> Option<&str> {
        None
    }
}

/// Map a method onto the standard verbs; anything else is `OTHER`.
pub fn normalize_method(method: &str) -> &'static str {
    match method.to_ascii_uppercase().as_str() {
        "GET" => "GET",
        "POST" => "POST",
        "PUT" => "PUT",
        "DELETE" => "DELETE",
        "PATCH" => "PATCH",
        "HEAD" => "HEAD",
        "OPTIONS" => "OPTIONS",
        "CONNECT" => "CONNECT",
        "TRACE" => "TRACE",
        _ => "OTHER",
    }
}

/// Value of the `status` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
    /// The handler failed before producing a status.
    Error,
    /// The request future was dropped before completing.
    Cancelled,
}

impl StatusClass {
    pub fn from_status(status: u16) -> Self {
        match status {
            100..=199 => Self::Informational,
            200..=299 => Self::Success,
            300..=399 => Self::Redirection,
            400..=499 => Self::ClientError,
            _ => Self::ServerError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Informational => "1xx",
            Self::Success => "2xx",
            Self::Redirection => "3xx",
            Self::ClientError => "4xx",
            Self::ServerError => "5xx",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the root span closes with error status.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ClientError | Self::ServerError | Self::Error | Self::Cancelled
        )
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A response with this status was produced.
    Responded(u16),
    /// The handler failed without a response, e.g. it panicked.
    Failed(String),
    Cancelled,
}

/// Labels and start time of one in-flight request.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: &'static str,
    pub route: String,
    pub start: Instant,
}

/// Context handed to handlers through request extensions.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Parent for every span the handler opens.
    pub span: SpanContext,
    pub tracer: Tracer,
}

/// Framework-independent request instrumentation.
#[derive(Clone)]
pub struct RequestInterceptor {
    recorder: MetricsRecorder,
    tracer: Tracer,
    propagator: Arc<CompositePropagator>,
    excluded_routes: Arc<HashSet<String>>,
}

impl RequestInterceptor {
    pub fn new(
        recorder: MetricsRecorder,
        tracer: Tracer,
        propagator: Arc<CompositePropagator>,
        excluded_routes: &[String],
    ) -> Self {
        Self {
            recorder,
            tracer,
            propagator,
            excluded_routes: Arc::new(excluded_routes.iter().cloned().collect()),
        }
    }

    pub fn from_telemetry(telemetry: &Telemetry, excluded_routes: &[String]) -> Self {
        Self::new(
            telemetry.recorder.clone(),
            telemetry.tracer.clone(),
            telemetry.propagator.clone(),
            excluded_routes,
        )
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Excluded routes are served without metrics or a root span.
    pub fn is_excluded(&self, route: &str) -> bool {
        self.excluded_routes.contains(route)
    }

    /// Trace context propagated by the caller, if any.
    pub fn extract(&self, carrier: &dyn Extractor) -> Option<SpanContext> {
        self.propagator.extract(carrier)
    }

    /// Start instrumenting `request`.
    pub fn begin(&self, request: &dyn InboundRequest) -> InFlightRequest {
        let record = RequestRecord {
            method: normalize_method(request.method()),
            route: request
                .route_template()
                .unwrap_or(UNMATCHED_ROUTE)
                .to_string(),
            start: Instant::now(),
        };

        let remote = self.extract(request.carrier());
        let mut span = self.tracer.start_root(
            format!("{} {}", record.method, record.route),
            SpanKind::Server,
            remote.as_ref(),
        );
        span.set_attribute("http.method", record.method);
        span.set_attribute("http.route", record.route.as_str());
        if let Some(id) = request.request_id() {
            span.set_attribute("http.request_id", id);
        }

        self.recorder.gauge_add(REQUESTS_IN_FLIGHT, &[], 1.0);

        InFlightRequest {
            record,
            span: Some(span),
            error: None,
            recorder: self.recorder.clone(),
        }
    }
}

/// A request between [`RequestInterceptor::begin`] and its terminal
/// observation. Dropping it unfinished records a cancellation.
pub struct InFlightRequest {
    record: RequestRecord,
    span: Option<ActiveSpan>,
    error: Option<String>,
    recorder: MetricsRecorder,
}

impl InFlightRequest {
    pub fn record(&self) -> &RequestRecord {
        &self.record
    }

    /// Context of the root span.
    pub fn context(&self) -> SpanContext {
        self.span
            .as_ref()
            .map(|s| s.context())
            .unwrap_or_default()
    }

    /// Describe a failure; recorded on the root span at completion.
    pub fn record_error(&mut self, description: impl Into<String>) {
        self.error = Some(description.into());
    }

    /// Record the terminal observation and close the root span.
    pub fn finish(mut self, outcome: Outcome) -> StatusClass {
        self.complete(outcome)
    }

    fn complete(&mut self, outcome: Outcome) -> StatusClass {
        let Some(mut span) = self.span.take() else {
            return StatusClass::Cancelled;
        };

        let class = match &outcome {
            Outcome::Responded(status) => StatusClass::from_status(*status),
            Outcome::Failed(_) => StatusClass::Error,
            Outcome::Cancelled => StatusClass::Cancelled,
        };
        let elapsed = self.record.start.elapsed().as_secs_f64();
        let method = self.record.method;
        let route = self.record.route.as_str();

        self.recorder.increment_counter(
            REQUESTS_TOTAL,
            &[("method", method), ("route", route), ("status", class.as_str())],
        );
        self.recorder
            .observe_histogram(REQUEST_DURATION, &[("method", method), ("route", route)], elapsed);
        self.recorder.gauge_add(REQUESTS_IN_FLIGHT, &[], -1.0);

        span.set_attribute("http.status_class", class.as_str());
        match outcome {
            Outcome::Responded(status) => span.set_attribute("http.status_code", status),
            Outcome::Failed(message) => span.record_error(message),
            Outcome::Cancelled => span.record_error("request cancelled"),
        }
        if let Some(error) = self.error.take() {
            span.record_error(error);
        }
        if class.is_failure() {
            span.set_status(SpanStatus::Error);
        }
        span.end();

        tracing::debug!(
            method,
            route,
            status = class.as_str(),
            elapsed_ms = elapsed * 1000.0,
            "Request completed"
        );
        class
    }
}

impl Drop for InFlightRequest {
    fn drop(&mut self) {
        if self.span.is_some() {
            let outcome = if std::thread::panicking() {
                Outcome::Failed("handler panicked".to_string())
            } else {
                Outcome::Cancelled
            };
            self.complete(outcome);
        }
    }
}

struct AxumRequest<'a> {
    method: &'a Method,
    route: Option<&'a str>,
    headers: &'a HeaderMap,
}

impl InboundRequest for AxumRequest<'_> {
    fn method(&self) -> &str {
        self.method.as_str()
    }

    fn route_template(&self) -> Option<&str> {
        self.route
    }

    fn carrier(&self) -> &dyn Extractor {
        self.headers
    }

    fn request_id(&self) -> Option<&str> {
        self.headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok())
    }
}

/// Axum middleware running every request through the interceptor.
///
/// Must be installed with `Router::layer` so the matched route is known.
pub async fn track_requests(
    State(interceptor): State<RequestInterceptor>,
    mut request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string());

    if route.as_deref().is_some_and(|r| interceptor.is_excluded(r)) {
        let span = interceptor.extract(request.headers()).unwrap_or_default();
        request.extensions_mut().insert(RequestContext {
            span,
            tracer: interceptor.tracer().clone(),
        });
        return next.run(request).await;
    }

    let mut in_flight = interceptor.begin(&AxumRequest {
        method: request.method(),
        route: route.as_deref(),
        headers: request.headers(),
    });
    request.extensions_mut().insert(RequestContext {
        span: in_flight.context(),
        tracer: interceptor.tracer().clone(),
    });

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => {
            if let Some(ErrorDetail(detail)) = response.extensions().get::<ErrorDetail>() {
                in_flight.record_error(detail.clone());
            }
            in_flight.finish(Outcome::Responded(response.status().as_u16()));
            response
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(panic = %message, "Handler panicked");
            in_flight.finish(Outcome::Failed(message));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": "Internal server error" })),
            )
                .into_response()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{
        AttributeValue, Sampler, SpanData, SpanId, SpanSink, TraceContextPropagator, TraceId,
    };
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct FakeRequest {
        method: &'static str,
        route: Option<&'static str>,
        headers: HashMap<String, String>,
    }

    impl FakeRequest {
        fn get(route: &'static str) -> Self {
            Self {
                method: "GET",
                route: Some(route),
                headers: HashMap::new(),
            }
        }
    }

    impl InboundRequest for FakeRequest {
        fn method(&self) -> &str {
            self.method
        }

        fn route_template(&self) -> Option<&str> {
            self.route
        }

        fn carrier(&self) -> &dyn Extractor {
            &self.headers
        }
    }

    fn interceptor() -> (RequestInterceptor, MetricsRecorder, mpsc::Receiver<SpanData>) {
        let recorder = MetricsRecorder::new();
        let (sink, rx) = SpanSink::bounded(64, recorder.clone());
        let interceptor = RequestInterceptor::new(
            recorder.clone(),
            Tracer::new(Sampler::AlwaysOn, sink),
            Arc::new(CompositePropagator::default()),
            &["/metrics".to_string()],
        );
        (interceptor, recorder, rx)
    }

    fn requests(recorder: &MetricsRecorder, method: &str, route: &str, status: &str) -> Option<u64> {
        recorder.counter_value(
            REQUESTS_TOTAL,
            &[("method", method), ("route", route), ("status", status)],
        )
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(StatusClass::from_status(101).as_str(), "1xx");
        assert_eq!(StatusClass::from_status(204).as_str(), "2xx");
        assert_eq!(StatusClass::from_status(302).as_str(), "3xx");
        assert_eq!(StatusClass::from_status(404).as_str(), "4xx");
        assert_eq!(StatusClass::from_status(503).as_str(), "5xx");
        assert!(!StatusClass::Success.is_failure());
        assert!(StatusClass::Cancelled.is_failure());
    }

    #[test]
    fn test_method_normalization() {
        assert_eq!(normalize_method("get"), "GET");
        assert_eq!(normalize_method("PATCH"), "PATCH");
        assert_eq!(normalize_method("PROPFIND"), "OTHER");
    }

    #[test]
    fn test_success_records_one_observation() {
        let (interceptor, recorder, mut rx) = interceptor();
        let request = interceptor.begin(&FakeRequest::get("/api/users/{user_id}"));
        assert_eq!(recorder.gauge_value(REQUESTS_IN_FLIGHT, &[]), Some(1.0));

        let class = request.finish(Outcome::Responded(200));
        assert_eq!(class, StatusClass::Success);

        assert_eq!(requests(&recorder, "GET", "/api/users/{user_id}", "2xx"), Some(1));
        let histogram = recorder
            .histogram_snapshot(
                REQUEST_DURATION,
                &[("method", "GET"), ("route", "/api/users/{user_id}")],
            )
            .unwrap();
        assert_eq!(histogram.count, 1);
        assert_eq!(recorder.gauge_value(REQUESTS_IN_FLIGHT, &[]), Some(0.0));

        let span = rx.try_recv().unwrap();
        assert_eq!(span.name, "GET /api/users/{user_id}");
        assert_eq!(span.kind, SpanKind::Server);
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(span.attribute("http.status_code"), Some(&AttributeValue::Int(200)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_server_error_marks_span() {
        let (interceptor, recorder, mut rx) = interceptor();
        let mut request = interceptor.begin(&FakeRequest::get("/api/simulate-error"));
        request.record_error("Simulated internal server error");
        request.finish(Outcome::Responded(500));

        assert_eq!(requests(&recorder, "GET", "/api/simulate-error", "5xx"), Some(1));
        let span = rx.try_recv().unwrap();
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(
            span.attribute("error.message"),
            Some(&AttributeValue::from("Simulated internal server error"))
        );
    }

    #[test]
    fn test_client_error_marks_span() {
        let (interceptor, _recorder, mut rx) = interceptor();
        interceptor
            .begin(&FakeRequest::get("/api/users/{user_id}"))
            .finish(Outcome::Responded(404));
        assert_eq!(rx.try_recv().unwrap().status, SpanStatus::Error);
    }

    #[test]
    fn test_drop_records_cancelled() {
        let (interceptor, recorder, mut rx) = interceptor();
        let request = interceptor.begin(&FakeRequest::get("/api/users"));
        drop(request);

        assert_eq!(requests(&recorder, "GET", "/api/users", "cancelled"), Some(1));
        assert_eq!(recorder.gauge_value(REQUESTS_IN_FLIGHT, &[]), Some(0.0));
        let span = rx.try_recv().unwrap();
        assert_eq!(span.status, SpanStatus::Error);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_handler_is_error_class() {
        let (interceptor, recorder, _rx) = interceptor();
        let class = interceptor
            .begin(&FakeRequest::get("/"))
            .finish(Outcome::Failed("boom".to_string()));
        assert_eq!(class, StatusClass::Error);
        assert_eq!(requests(&recorder, "GET", "/", "error"), Some(1));
    }

    #[test]
    fn test_unmatched_and_unknown_method() {
        let (interceptor, recorder, _rx) = interceptor();
        interceptor
            .begin(&FakeRequest {
                method: "BREW",
                route: None,
                headers: HashMap::new(),
            })
            .finish(Outcome::Responded(404));
        assert_eq!(requests(&recorder, "OTHER", UNMATCHED_ROUTE, "4xx"), Some(1));
    }

    #[test]
    fn test_inbound_trace_is_continued() {
        let (interceptor, _recorder, mut rx) = interceptor();
        let remote_trace = TraceId::generate();
        let remote_span = SpanId::generate();
        let mut request = FakeRequest::get("/");
        request.headers.insert(
            "traceparent".to_string(),
            format!("00-{}-{}-01", remote_trace, remote_span),
        );

        let in_flight = interceptor.begin(&request);
        assert_eq!(in_flight.context().trace_id, remote_trace);
        in_flight.finish(Outcome::Responded(200));

        let span = rx.try_recv().unwrap();
        assert_eq!(span.trace_id, remote_trace);
        assert_eq!(span.parent_span_id, Some(remote_span));
    }

    #[test]
    fn test_malformed_trace_header_starts_new_trace() {
        let (interceptor, _recorder, mut rx) = interceptor();
        let mut request = FakeRequest::get("/");
        request
            .headers
            .insert(TraceContextPropagator::TRACEPARENT.to_string(), "00-bogus".to_string());

        interceptor.begin(&request).finish(Outcome::Responded(200));
        let span = rx.try_recv().unwrap();
        assert!(span.trace_id.is_valid());
        assert!(span.parent_span_id.is_none());
    }

    #[test]
    fn test_excluded_routes() {
        let (interceptor, _recorder, _rx) = interceptor();
        assert!(interceptor.is_excluded("/metrics"));
        assert!(!interceptor.is_excluded("/"));
    }

    async fn boom() -> &'static str {
        panic!("kaboom")
    }

    async fn slow() -> &'static str {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        "done"
    }

    #[allow(deprecated)]
    fn router(interceptor: RequestInterceptor) -> axum::Router {
        use axum::routing::get;
        use tower_http::timeout::TimeoutLayer;

        axum::Router::new()
            .route("/boom", get(boom))
            .route("/slow", get(slow))
            .layer(axum::middleware::from_fn_with_state(interceptor, track_requests))
            .layer(TimeoutLayer::new(std::time::Duration::from_millis(20)))
    }

    async fn send(router: axum::Router, path: &str) -> Response {
        use tower::ServiceExt;

        router
            .oneshot(
                axum::http::Request::get(path)
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_panicking_handler_returns_500() {
        let (interceptor, recorder, mut rx) = interceptor();

        let response = send(router(interceptor), "/boom").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(requests(&recorder, "GET", "/boom", "error"), Some(1));
        assert_eq!(recorder.gauge_value(REQUESTS_IN_FLIGHT, &[]), Some(0.0));
        let span = rx.try_recv().unwrap();
        assert_eq!(span.name, "GET /boom");
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.attribute("error.message"), Some(&AttributeValue::from("kaboom")));
    }

    #[tokio::test]
    async fn test_timed_out_handler_is_cancelled() {
        let (interceptor, recorder, mut rx) = interceptor();

        let response = send(router(interceptor), "/slow").await;
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

        assert_eq!(requests(&recorder, "GET", "/slow", "cancelled"), Some(1));
        assert_eq!(requests(&recorder, "GET", "/slow", "2xx"), None);
        assert_eq!(recorder.gauge_value(REQUESTS_IN_FLIGHT, &[]), Some(0.0));
        let span = rx.try_recv().unwrap();
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(
            span.attribute("http.status_class"),
            Some(&AttributeValue::from("cancelled"))
        );
    }
}
