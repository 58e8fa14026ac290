//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global `tracing` subscriber
//! - Choose between human-readable and JSON output
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level, so operators can raise
//!   verbosity for one module without touching the config file
//! - Pretty format for development, JSON for log aggregation
//! - Installing twice is an error returned to the caller, not a panic

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::schema::{LogFormat, LoggingConfig};

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_new(&config.level).unwrap_or_else(|e| {
        eprintln!("invalid log level `{}` ({}), falling back to info", config.level, e);
        EnvFilter::new("info")
    })
}

/// Install the global subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config));

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_accepts_directives() {
        let config = LoggingConfig {
            level: "telemetry_demo=debug,tower_http=info".to_string(),
            ..LoggingConfig::default()
        };
        let filter = default_filter(&config).to_string();
        assert!(filter.contains("telemetry_demo=debug"));
        assert!(filter.contains("tower_http=info"));
    }

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        let config = LoggingConfig {
            level: "loud=[".to_string(),
            ..LoggingConfig::default()
        };
        assert_eq!(default_filter(&config).to_string(), "info");
    }
}
