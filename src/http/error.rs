//! API error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::simulation::UserError;

/// Failure description attached to error responses; the request
/// interceptor records it on the root span.
#[derive(Debug, Clone)]
pub struct ErrorDetail(pub String);

/// Errors surfaced to API callers as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<UserError> for ApiError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::NotFound(_) => Self::NotFound(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.to_string();
        let mut response = (self.status(), Json(json!({ "detail": detail }))).into_response();
        response.extensions_mut().insert(ErrorDetail(detail));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_response() {
        let response = ApiError::from(UserError::NotFound(404)).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let detail = response.extensions().get::<ErrorDetail>().unwrap();
        assert_eq!(detail.0, "User not found");
    }

    #[test]
    fn test_internal_status() {
        let err = ApiError::Internal("Simulated internal server error".to_string());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
