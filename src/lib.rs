//! Instrumented demo service library.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod simulation;
pub mod trace;

pub use config::schema::ServiceConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use observability::Telemetry;
