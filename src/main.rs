//! Instrumented demo service.
//!
//! A small HTTP API whose only job is to produce telemetry: Prometheus
//! metrics for every request and distributed traces exported to an OTLP
//! collector such as Jaeger.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ http server ──▶ interceptor ──▶ handlers ──▶ simulated user store
//!                                        │                              │
//!                                        ▼                              ▼
//!                                  metrics registry ◀─────────── child spans
//!                                        │                              │
//!                                        ▼                              ▼
//!                                  GET /metrics                 span queue ──▶ batch processor ──▶ collector
//! ```
//!
//! # Shutdown
//!
//! SIGINT/SIGTERM stops the HTTP server first, then the span processor
//! drains its queue and makes a final export bounded by the export timeout.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use telemetry_demo::config;
use telemetry_demo::http::HttpServer;
use telemetry_demo::lifecycle::{wait_for_signal, Shutdown};
use telemetry_demo::observability::{logging, Telemetry};
use telemetry_demo::simulation;

#[derive(Parser)]
#[command(name = "telemetry-demo")]
#[command(about = "HTTP service instrumented with Prometheus metrics and distributed tracing")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Failed to install log subscriber: {}", e);
    }

    tracing::info!(
        service = %config.tracing.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "telemetry-demo starting"
    );
    tracing::info!(
        bind_address = %config.listener.bind_address,
        exporter = ?config.tracing.exporter,
        collector = %config.tracing.collector_endpoint,
        sampler = ?config.tracing.sampler,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    let (telemetry, processor) = Telemetry::init(&config);
    if metrics::set_global_recorder(telemetry.recorder.clone()).is_err() {
        tracing::warn!("A global metrics recorder is already installed");
    }
    simulation::users::describe_metrics();

    let export_shutdown = Shutdown::new();
    let processor_task = processor.map(|p| tokio::spawn(p.run(export_shutdown.subscribe())));

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let http_shutdown = Shutdown::new();
    let export_timeout = Duration::from_millis(config.tracing.export_timeout_ms);
    let server = HttpServer::new(config, &telemetry);
    let server_task = tokio::spawn(server.run(listener, http_shutdown.subscribe()));
    drop(telemetry);

    wait_for_signal().await;
    http_shutdown.trigger();

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server failed"),
        Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
    }

    export_shutdown.trigger();
    if let Some(task) = processor_task {
        // room for one export after the queue drains
        let deadline = export_timeout + Duration::from_secs(1);
        if tokio::time::timeout(deadline, task).await.is_err() {
            tracing::warn!(
                timeout_ms = deadline.as_millis() as u64,
                "Span processor did not finish in time, exiting"
            );
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
