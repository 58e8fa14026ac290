//! Outbound HTTP with trace propagation.

use std::sync::Arc;

use axum::http::HeaderMap;

use super::context::SpanContext;
use super::propagation::CompositePropagator;
use super::span::{ActiveSpan, SpanStatus};
use super::tracer::Tracer;

/// A `reqwest` client that opens a client span per call and injects its
/// context into the request headers.
#[derive(Clone)]
pub struct TracedClient {
    client: reqwest::Client,
    tracer: Tracer,
    propagator: Arc<CompositePropagator>,
}

impl TracedClient {
    pub fn new(client: reqwest::Client, tracer: Tracer, propagator: Arc<CompositePropagator>) -> Self {
        Self {
            client,
            tracer,
            propagator,
        }
    }

    /// Send `request` as a child of `parent`.
    ///
    /// The span is named `"{METHOD} {host}"` and records the response status.
    /// Transport errors and 5xx responses mark it failed.
    pub async fn execute(
        &self,
        parent: &SpanContext,
        mut request: reqwest::Request,
    ) -> reqwest::Result<reqwest::Response> {
        let host = request.url().host_str().unwrap_or("unknown").to_string();
        let mut span = self
            .tracer
            .begin_client(parent, format!("{} {}", request.method(), host));
        span.set_attribute("http.method", request.method().as_str());
        span.set_attribute("http.url", request.url().as_str());

        let mut headers = HeaderMap::new();
        self.propagator.inject(&span.context(), &mut headers);
        request.headers_mut().extend(headers);

        let result = self.client.execute(request).await;
        finish(&mut span, &result);
        span.end();
        result
    }

    /// `GET url` as a child of `parent`.
    pub async fn get(&self, parent: &SpanContext, url: &str) -> reqwest::Result<reqwest::Response> {
        let request = self.client.get(url).build()?;
        self.execute(parent, request).await
    }

    /// `POST url` with a JSON body as a child of `parent`.
    pub async fn post_json<T: serde::Serialize + ?Sized>(
        &self,
        parent: &SpanContext,
        url: &str,
        body: &T,
    ) -> reqwest::Result<reqwest::Response> {
        let request = self.client.post(url).json(body).build()?;
        self.execute(parent, request).await
    }
}

fn finish(span: &mut ActiveSpan, result: &reqwest::Result<reqwest::Response>) {
    match result {
        Ok(response) => {
            let status = response.status();
            span.set_attribute("http.status_code", status.as_u16());
            if status.is_server_error() {
                span.set_status(SpanStatus::Error);
            }
        }
        Err(e) => span.record_error(e),
    }
}
