//! Configuration loading from disk and the environment.

use std::fs;
use std::path::Path;

use thiserror::Error;
use url::Url;

use crate::config::schema::ServiceConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load `path` (or defaults when `None`), apply environment overrides, then
/// validate the result.
pub fn load(path: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
    let config = match path {
        Some(path) => toml::from_str(&fs::read_to_string(path)?)?,
        None => ServiceConfig::default(),
    };
    let config = apply_env_overrides_from(config, |key| std::env::var(key).ok());

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply deployment overrides read through `lookup`.
///
/// | Variable            | Setting                                  |
/// |---------------------|------------------------------------------|
/// | `APP_BIND_ADDRESS`  | `listener.bind_address`                  |
/// | `COLLECTOR_HOST`    | host part of `tracing.collector_endpoint` |
/// | `COLLECTOR_PORT`    | port part of `tracing.collector_endpoint` |
/// | `OTEL_SERVICE_NAME` | `tracing.service_name`                   |
/// | `LOG_LEVEL`         | `logging.level`                          |
pub fn apply_env_overrides_from<F>(mut config: ServiceConfig, lookup: F) -> ServiceConfig
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(addr) = lookup("APP_BIND_ADDRESS") {
        config.listener.bind_address = addr;
    }
    if let Some(name) = lookup("OTEL_SERVICE_NAME") {
        config.tracing.service_name = name;
    }
    if let Some(level) = lookup("LOG_LEVEL") {
        config.logging.level = level.to_lowercase();
    }

    let host = lookup("COLLECTOR_HOST");
    let port = lookup("COLLECTOR_PORT");
    if host.is_some() || port.is_some() {
        config.tracing.collector_endpoint = override_endpoint(
            &config.tracing.collector_endpoint,
            host.as_deref(),
            port.as_deref(),
        );
    }

    config
}

fn override_endpoint(endpoint: &str, host: Option<&str>, port: Option<&str>) -> String {
    if let Ok(mut url) = Url::parse(endpoint) {
        let host_ok = host.map_or(true, |h| url.set_host(Some(h)).is_ok());
        let port_ok = match port.map(str::parse::<u16>) {
            Some(Ok(p)) => url.set_port(Some(p)).is_ok(),
            Some(Err(_)) => false,
            None => true,
        };
        if host_ok && port_ok {
            return url.as_str().trim_end_matches('/').to_string();
        }
    }

    // left for validation to reject
    format!(
        "http://{}:{}",
        host.unwrap_or("localhost"),
        port.unwrap_or("4318")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let config = apply_env_overrides_from(
            ServiceConfig::default(),
            env(&[
                ("APP_BIND_ADDRESS", "127.0.0.1:9000"),
                ("COLLECTOR_HOST", "jaeger"),
                ("OTEL_SERVICE_NAME", "users-api"),
                ("LOG_LEVEL", "DEBUG"),
            ]),
        );

        assert_eq!(config.listener.bind_address, "127.0.0.1:9000");
        assert_eq!(config.tracing.collector_endpoint, "http://jaeger:4318");
        assert_eq!(config.tracing.service_name, "users-api");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_collector_port_override() {
        let config = apply_env_overrides_from(
            ServiceConfig::default(),
            env(&[("COLLECTOR_HOST", "otel"), ("COLLECTOR_PORT", "14318")]),
        );
        assert_eq!(config.tracing.collector_endpoint, "http://otel:14318");
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let config =
            apply_env_overrides_from(ServiceConfig::default(), env(&[("APP_BIND_ADDRESS", " ")]));
        assert_eq!(config.listener.bind_address, "0.0.0.0:8000");
    }

    #[test]
    fn test_bad_port_fails_validation() {
        let config = apply_env_overrides_from(
            ServiceConfig::default(),
            env(&[("COLLECTOR_PORT", "not-a-port")]),
        );
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join(format!("telemetry-demo-{}.toml", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[listener]\nbind_address = \"127.0.0.1:8123\"").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:8123");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_invalid_file_reports_validation_errors() {
        let path = std::env::temp_dir().join(format!("telemetry-demo-{}.toml", uuid::Uuid::new_v4()));
        fs::write(&path, "[tracing]\nsampling_ratio = 2.0\nmax_queue_size = 0\n").unwrap();

        let err = load(Some(&path)).unwrap_err();
        fs::remove_file(&path).unwrap();
        match err {
            ConfigError::Validation(errors) => assert!(errors.len() >= 2),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load(Some(Path::new("/nonexistent/telemetry-demo.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
