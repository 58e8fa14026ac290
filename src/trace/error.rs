//! Trace pipeline error types.

use thiserror::Error;

/// Errors raised while parsing, propagating or exporting trace data.
///
/// None of these ever reach an HTTP caller: propagation errors degrade to
/// "no inbound context" and export errors drop the affected batch.
#[derive(Debug, Error)]
pub enum TraceError {
    /// A trace id was not 32 hex characters or was all zeros.
    #[error("invalid trace id: {0}")]
    InvalidTraceId(String),

    /// A span id was not 16 hex characters or was all zeros.
    #[error("invalid span id: {0}")]
    InvalidSpanId(String),

    /// A propagation header was present but malformed.
    #[error("propagation error: {0}")]
    Propagation(String),

    /// The collector rejected a batch.
    #[error("export error: {0}")]
    Export(String),

    /// Transport failure talking to the collector.
    #[error("collector request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// A batch could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for the trace subsystem.
pub type TraceResult<T> = Result<T, TraceError>;
