//! Endpoint handlers.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::{rejection::PathRejection, Path, State},
    http::header,
    response::IntoResponse,
    Extension, Json,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::http::error::ApiError;
use crate::http::interceptor::RequestContext;
use crate::http::server::AppState;
use crate::observability::metrics::{REQUESTS_IN_FLIGHT, REQUESTS_TOTAL, SPAN_EXPORT_TOTAL};
use crate::simulation::{self, CreatedUser, UserRecord};

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub async fn root() -> Json<Value> {
    Json(json!({ "message": "Hello World! This is an instrumented Rust service." }))
}

pub async fn health() -> Json<Value> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    Json(json!({ "status": "healthy", "timestamp": timestamp }))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    user_id: Result<Path<i64>, PathRejection>,
) -> Result<Json<UserRecord>, ApiError> {
    let Path(user_id) = user_id.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let user = simulation::lookup_user(&state.simulator, &ctx.tracer, &ctx.span, user_id).await?;
    tracing::debug!(user_id, "User fetched");
    Ok(Json(user))
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<CreatedUser>, ApiError> {
    let user = simulation::create_user(&state.simulator, &ctx.tracer, &ctx.span).await?;
    tracing::info!(user_id = user.user_id, "User created");
    Ok(Json(user))
}

pub async fn simulate_error(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    if state.simulator.should_fail() {
        tracing::warn!("Simulated failure triggered");
        return Err(ApiError::Internal("Simulated internal server error".to_string()));
    }
    Ok(Json(json!({ "message": "Success! No error this time." })))
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.telemetry.recorder.render_snapshot(),
    )
}

/// Body of `GET /custom-metrics`.
#[derive(Debug, Serialize)]
pub struct MetricsSummary {
    pub service: String,
    pub version: &'static str,
    pub uptime_seconds: f64,
    /// Completed requests keyed by status class.
    pub requests: BTreeMap<String, u64>,
    pub requests_in_flight: f64,
    /// Closed spans keyed by export outcome.
    pub trace_export: BTreeMap<String, u64>,
}

pub async fn custom_metrics(State(state): State<AppState>) -> Json<MetricsSummary> {
    let recorder = &state.telemetry.recorder;

    Json(MetricsSummary {
        service: state.service_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs_f64(),
        requests: sum_by_label(recorder.counter_series(REQUESTS_TOTAL), "status"),
        requests_in_flight: recorder.gauge_value(REQUESTS_IN_FLIGHT, &[]).unwrap_or(0.0),
        trace_export: sum_by_label(recorder.counter_series(SPAN_EXPORT_TOTAL), "outcome"),
    })
}

fn sum_by_label(series: Vec<(Vec<(String, String)>, u64)>, label: &str) -> BTreeMap<String, u64> {
    let mut totals = BTreeMap::new();
    for (labels, value) in series {
        if let Some((_, key)) = labels.into_iter().find(|(name, _)| name == label) {
            *totals.entry(key).or_insert(0) += value;
        }
    }
    totals
}
