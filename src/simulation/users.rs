//! Simulated user store.
//!
//! Each operation opens child spans under the caller's context and sleeps
//! for the drawn latency inside them, so traces show where the time went.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::Simulator;
use crate::trace::{KeyValue, SpanContext, Tracer};

/// Looking up this id always fails with "not found".
pub const MISSING_USER_ID: i64 = 404;

pub const DB_QUERIES_TOTAL: &str = "app_db_queries_total";
pub const DB_QUERY_DURATION: &str = "app_db_query_duration_seconds";

/// Operation names, shared by the `db.operation` span attribute and the
/// `operation` metric label.
const SELECT: &str = "SELECT";
const INSERT: &str = "INSERT";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: String,
    pub email: String,
    /// Simulated latency in seconds.
    pub processing_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedUser {
    pub user_id: u32,
    pub username: String,
    pub email: String,
    pub created: bool,
    pub processing_time: f64,
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("User not found")]
    NotFound(i64),
}

/// Register help text for the store's metrics with the global recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(DB_QUERIES_TOTAL, "Simulated database queries by operation");
    metrics::describe_histogram!(
        DB_QUERY_DURATION,
        "Simulated database query latency in seconds by operation"
    );
}

fn db_attributes(operation: &'static str) -> [KeyValue; 3] {
    [
        KeyValue::new("db.system", "simulated"),
        KeyValue::new("db.operation", operation),
        KeyValue::new("db.table", "users"),
    ]
}

fn record_query(operation: &'static str, elapsed: Duration) {
    metrics::counter!(DB_QUERIES_TOTAL, "operation" => operation).increment(1);
    metrics::histogram!(DB_QUERY_DURATION, "operation" => operation).record(elapsed.as_secs_f64());
}

/// Fetch one user.
///
/// Opens `user.lookup` (with `user.id`) and a `db.query` child.
pub async fn lookup_user(
    simulator: &Simulator,
    tracer: &Tracer,
    parent: &SpanContext,
    user_id: i64,
) -> Result<UserRecord, UserError> {
    let mut span = tracer.begin(parent, "user.lookup", [KeyValue::new("user.id", user_id)]);
    let delay = simulator.lookup_delay();

    let query = tracer.begin(&span.context(), "db.query", db_attributes(SELECT));
    tokio::time::sleep(delay).await;
    query.end();
    record_query(SELECT, delay);

    let processing_time = delay.as_secs_f64();
    span.set_attribute("processing_time", processing_time);

    if user_id == MISSING_USER_ID {
        let err = UserError::NotFound(user_id);
        span.record_error(&err);
        span.end();
        return Err(err);
    }
    span.end();

    Ok(UserRecord {
        user_id,
        username: format!("user_{}", user_id),
        email: format!("user_{}@example.com", user_id),
        processing_time,
    })
}

/// Create a user.
///
/// Opens `user.validate` then `db.insert`; a quarter of the drawn latency is
/// spent validating.
pub async fn create_user(
    simulator: &Simulator,
    tracer: &Tracer,
    parent: &SpanContext,
) -> Result<CreatedUser, UserError> {
    let total = simulator.create_delay();
    let validate = total / 4;
    let insert = total - validate;

    tracer
        .in_span(parent, "user.validate", [], |_ctx| async move {
            tokio::time::sleep(validate).await;
            Ok::<(), UserError>(())
        })
        .await?;

    let user_id = simulator.new_user_id();
    let mut attributes = db_attributes(INSERT).to_vec();
    attributes.push(KeyValue::new("user.id", u64::from(user_id)));

    tracer
        .in_span(parent, "db.insert", attributes, |_ctx| async move {
            tokio::time::sleep(insert).await;
            Ok::<(), UserError>(())
        })
        .await?;
    record_query(INSERT, insert);

    Ok(CreatedUser {
        user_id,
        username: format!("user_{}", user_id),
        email: format!("user_{}@example.com", user_id),
        created: true,
        processing_time: total.as_secs_f64(),
    })
}
