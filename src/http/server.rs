//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (request ID, tracing, timeout, request interceptor)
//! - Bind server to listener and drain on shutdown

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ServiceConfig;
use crate::http::handlers;
use crate::http::interceptor::{track_requests, RequestInterceptor};
use crate::http::request::{propagate_request_id, set_request_id};
use crate::lifecycle::recv_shutdown;
use crate::observability::Telemetry;
use crate::simulation::Simulator;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub telemetry: Telemetry,
    pub simulator: Arc<Simulator>,
    pub service_name: String,
    pub started_at: Instant,
}

/// HTTP server for the demo API.
pub struct HttpServer {
    router: Router,
    config: ServiceConfig,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ServiceConfig, telemetry: &Telemetry) -> Self {
        let state = AppState {
            telemetry: telemetry.clone(),
            simulator: Arc::new(Simulator::new(config.simulation.clone())),
            service_name: config.tracing.service_name.clone(),
            started_at: Instant::now(),
        };
        let interceptor =
            RequestInterceptor::from_telemetry(telemetry, &config.metrics.excluded_routes);

        let router = Self::build_router(&config, state, interceptor);
        Self { router, config }
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// The interceptor is applied per route so it sees the matched template.
    #[allow(deprecated)]
    fn build_router(config: &ServiceConfig, state: AppState, interceptor: RequestInterceptor) -> Router {
        Router::new()
            .route("/", get(handlers::root))
            .route("/health", get(handlers::health))
            .route("/api/users/{user_id}", get(handlers::get_user))
            .route("/api/users", post(handlers::create_user))
            .route("/api/simulate-error", get(handlers::simulate_error))
            .route("/metrics", get(handlers::metrics))
            .route("/custom-metrics", get(handlers::custom_metrics))
            .fallback(not_found)
            .layer(middleware::from_fn_with_state(interceptor, track_requests))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(propagate_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id())
    }

    /// The fully layered router.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server until `shutdown` fires, then drain open connections.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            service = %self.config.tracing.service_name,
            "HTTP server starting"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(recv_shutdown(shutdown))
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "detail": "Not Found" })))
}
