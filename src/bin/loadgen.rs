use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use rand::seq::SliceRandom;

use telemetry_demo::config::schema::{ExporterKind, TracingConfig};
use telemetry_demo::lifecycle::Shutdown;
use telemetry_demo::observability::MetricsRecorder;
use telemetry_demo::trace::{pipeline, CompositePropagator, Exporter, SpanContext, TracedClient};

#[derive(Parser)]
#[command(name = "loadgen")]
#[command(about = "Traffic generator for the telemetry demo service", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8000")]
    url: String,

    /// Where the generator's own client spans go
    #[arg(long, value_enum, default_value_t = SpanOutput::None)]
    spans: SpanOutput,

    #[arg(long, default_value = "http://localhost:4318")]
    collector: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call every endpoint once
    Smoke,
    /// Send a random mix of requests
    Traffic {
        #[arg(long, default_value_t = 60)]
        duration_secs: u64,
        /// Requests per second
        #[arg(long, default_value_t = 2.0, value_parser = parse_rate)]
        rate: f64,
    },
}

fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if !rate.is_finite() || rate <= 0.0 {
        return Err(format!("rate must be a positive number, got {s}"));
    }
    Ok(rate)
}

/// Tick period for `rate` requests per second, never below one millisecond.
fn request_period(rate: f64) -> Duration {
    const MIN_PERIOD: Duration = Duration::from_millis(1);
    const MAX_PERIOD: Duration = Duration::from_secs(100);

    if !rate.is_finite() || rate <= 0.0 {
        return MAX_PERIOD;
    }
    Duration::try_from_secs_f64(1.0 / rate)
        .unwrap_or(MAX_PERIOD)
        .clamp(MIN_PERIOD, MAX_PERIOD)
}

#[derive(Clone, Copy, ValueEnum)]
enum SpanOutput {
    Otlp,
    Log,
    None,
}

#[derive(Clone, Copy)]
enum Call {
    Get(&'static str),
    Post(&'static str),
}

impl Call {
    fn method(&self) -> &'static str {
        match self {
            Call::Get(_) => "GET",
            Call::Post(_) => "POST",
        }
    }

    fn path(&self) -> &'static str {
        match self {
            Call::Get(p) | Call::Post(p) => p,
        }
    }
}

const SMOKE: &[Call] = &[
    Call::Get("/"),
    Call::Get("/health"),
    Call::Get("/api/users/123"),
    Call::Get("/api/users/404"),
    Call::Post("/api/users"),
    Call::Get("/api/simulate-error"),
    Call::Get("/metrics"),
    Call::Get("/custom-metrics"),
];

const TRAFFIC: &[(Call, u32)] = &[
    (Call::Get("/"), 1),
    (Call::Get("/health"), 1),
    (Call::Get("/api/users/123"), 3),
    (Call::Get("/api/users/456"), 3),
    (Call::Get("/api/users/789"), 3),
    (Call::Get("/api/users/404"), 1),
    (Call::Post("/api/users"), 2),
    (Call::Get("/api/simulate-error"), 2),
];

struct Outcome {
    status: Option<u16>,
    elapsed: Duration,
}

impl Outcome {
    fn is_success(&self) -> bool {
        self.status.is_some_and(|s| s < 400)
    }
}

async fn send(client: &TracedClient, base: &str, call: Call) -> Outcome {
    let url = format!("{}{}", base.trim_end_matches('/'), call.path());
    let root = SpanContext::invalid();
    let start = Instant::now();

    let result = match call {
        Call::Get(_) => client.get(&root, &url).await,
        Call::Post(_) => client.post_json(&root, &url, &serde_json::json!({})).await,
    };
    Outcome {
        status: result.ok().map(|r| r.status().as_u16()),
        elapsed: start.elapsed(),
    }
}

async fn smoke(client: &TracedClient, base: &str) {
    for call in SMOKE {
        let outcome = send(client, base, *call).await;
        let status = outcome
            .status
            .map_or_else(|| "error".to_string(), |s| s.to_string());
        println!(
            "{} {:4} {:22} -> {} ({:.0} ms)",
            if outcome.is_success() { "ok  " } else { "FAIL" },
            call.method(),
            call.path(),
            status,
            outcome.elapsed.as_secs_f64() * 1000.0
        );
    }
}

async fn traffic(client: &TracedClient, base: &str, duration: Duration, rate: f64) {
    let mut ticker = tokio::time::interval(request_period(rate));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    println!("Sending ~{:.1} req/s to {} for {}s", rate, base, duration.as_secs());

    let start = Instant::now();
    let (mut total, mut succeeded) = (0u64, 0u64);
    while start.elapsed() < duration {
        ticker.tick().await;
        let call = TRAFFIC
            .choose_weighted(&mut rand::thread_rng(), |(_, weight)| *weight)
            .map(|(call, _)| *call)
            .unwrap_or(Call::Get("/"));

        let outcome = send(client, base, call).await;
        total += 1;
        if outcome.is_success() {
            succeeded += 1;
        }
        if total % 10 == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            println!(
                "{:6.1}s | {:5.1} req/s | {:5.1}% ok | total {}",
                elapsed,
                total as f64 / elapsed,
                succeeded as f64 * 100.0 / total as f64,
                total
            );
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    println!("Duration:   {:.1}s", elapsed);
    println!("Requests:   {}", total);
    println!("Succeeded:  {}", succeeded);
    println!("Failed:     {}", total - succeeded);
    if total > 0 {
        println!("Success:    {:.1}%", succeeded as f64 * 100.0 / total as f64);
        println!("Rate:       {:.1} req/s", total as f64 / elapsed);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,telemetry_demo::spans=info".into()),
        )
        .init();

    let config = TracingConfig {
        service_name: "loadgen".to_string(),
        exporter: match cli.spans {
            SpanOutput::Otlp => ExporterKind::Otlp,
            SpanOutput::Log => ExporterKind::Log,
            SpanOutput::None => ExporterKind::None,
        },
        collector_endpoint: cli.collector.clone(),
        flush_interval_ms: 1000,
        ..TracingConfig::default()
    };
    let (tracer, processor) = pipeline(Exporter::from_config(&config), &config, MetricsRecorder::new());

    let shutdown = Shutdown::new();
    let processor_task = tokio::spawn(processor.run(shutdown.subscribe()));

    let client = TracedClient::new(
        reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?,
        tracer,
        Arc::new(CompositePropagator::default()),
    );

    match cli.command {
        Commands::Smoke => smoke(&client, &cli.url).await,
        Commands::Traffic {
            duration_secs,
            rate,
        } => traffic(&client, &cli.url, Duration::from_secs(duration_secs), rate).await,
    }

    drop(client);
    shutdown.trigger();
    let _ = tokio::time::timeout(Duration::from_secs(5), processor_task).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_period() {
        assert_eq!(request_period(2.0), Duration::from_millis(500));
        assert_eq!(request_period(1e12), Duration::from_millis(1));
        assert_eq!(request_period(f64::INFINITY), Duration::from_secs(100));
        assert_eq!(request_period(0.0), Duration::from_secs(100));
        assert_eq!(request_period(1e-9), Duration::from_secs(100));
    }

    #[test]
    fn test_rate_must_be_positive_and_finite() {
        assert_eq!(parse_rate("2.5"), Ok(2.5));
        assert!(parse_rate("inf").is_err());
        assert!(parse_rate("NaN").is_err());
        assert!(parse_rate("0").is_err());
        assert!(parse_rate("-1").is_err());
        assert!(parse_rate("fast").is_err());
    }

    #[test]
    fn test_cli_rejects_infinite_rate() {
        assert!(Cli::try_parse_from(["loadgen", "traffic", "--rate", "inf"]).is_err());
        let cli = Cli::try_parse_from(["loadgen", "traffic", "--rate", "1000000"]).unwrap();
        match cli.command {
            Commands::Traffic { rate, .. } => assert_eq!(request_period(rate), Duration::from_millis(1)),
            Commands::Smoke => panic!("expected traffic"),
        }
    }
}
