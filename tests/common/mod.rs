//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::time::Duration;

use telemetry_demo::config::schema::LatencyRange;
use telemetry_demo::http::HttpServer;
use telemetry_demo::lifecycle::Shutdown;
use telemetry_demo::trace::{InMemoryExporter, SpanData, SpanExporter};
use telemetry_demo::{ServiceConfig, Telemetry};
use tokio::net::TcpListener;

/// A running service on an ephemeral local port.
pub struct TestApp {
    pub base_url: String,
    pub telemetry: Telemetry,
    pub client: reqwest::Client,
    shutdown: Shutdown,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    pub async fn post(&self, path: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap()
    }

    pub async fn metrics_text(&self) -> String {
        self.get("/metrics").await.text().await.unwrap()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Config for fast, deterministic tests: no simulated latency, short
/// flush interval, fixed seed.
pub fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.tracing.flush_interval_ms = 20;
    config.simulation.seed = Some(7);
    config.simulation.user_lookup_latency_ms = LatencyRange::new(0, 0);
    config.simulation.user_create_latency_ms = LatencyRange::new(0, 0);
    config
}

/// Start the service exporting into an in-memory store.
pub async fn spawn_app(
    configure: impl FnOnce(&mut ServiceConfig),
) -> (TestApp, InMemoryExporter) {
    let mut config = test_config();
    configure(&mut config);
    let exporter = InMemoryExporter::new();
    let app = spawn_with_exporter(config, exporter.clone()).await;
    (app, exporter)
}

/// Start the service exporting through `exporter`.
pub async fn spawn_with_exporter<E: SpanExporter>(config: ServiceConfig, exporter: E) -> TestApp {
    let (telemetry, processor) = Telemetry::with_exporter(&config, exporter);
    start(config, telemetry, processor).await
}

/// Start the service with the exporter its config names.
pub async fn spawn_configured(config: ServiceConfig) -> TestApp {
    let (telemetry, processor) = Telemetry::init(&config);
    start(config, telemetry, processor).await
}

async fn start<E: SpanExporter>(
    config: ServiceConfig,
    telemetry: Telemetry,
    processor: Option<telemetry_demo::trace::BatchSpanProcessor<E>>,
) -> TestApp {
    let shutdown = Shutdown::new();
    if let Some(processor) = processor {
        tokio::spawn(processor.run(shutdown.subscribe()));
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config, &telemetry);
    tokio::spawn(server.run(listener, shutdown.subscribe()));

    TestApp {
        base_url: format!("http://{}", addr),
        telemetry,
        client: reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap(),
        shutdown,
    }
}

/// Poll `exporter` until `done` holds for its spans, or give up after 5s.
pub async fn wait_for_spans(
    exporter: &InMemoryExporter,
    done: impl Fn(&[SpanData]) -> bool,
) -> Vec<SpanData> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let spans = exporter.spans();
        if done(&spans) || tokio::time::Instant::now() >= deadline {
            return spans;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `check` every 10ms for up to 5s.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
