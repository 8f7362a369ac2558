//! The closed error taxonomy surfaced across the HTTP boundary.
//!
//! Internal plumbing (the executor, the queue manager, the store) returns
//! `anyhow::Result`; handlers convert into `DispatchError` at the edge so the
//! status-code mapping lives in exactly one place.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("authorization header required")]
    MissingAuth,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("not authorized to access this resource")]
    Forbidden,

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("invalid YAML format: {0}")]
    InvalidYaml(String),

    #[error("code security check failed: {0}")]
    UnsafeCode(String),

    #[error("code does not appear relevant to the competition: {0}")]
    IrrelevantCode(String),

    #[error("job {0} not found")]
    NotFound(uuid::Uuid),

    #[error("job already {0}")]
    AlreadyTerminal(String),

    #[error("rate limit exceeded. {0}")]
    RateLimited(String),

    #[error("queue limit exceeded. {0}")]
    QueueLimit(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::MissingAuth | DispatchError::InvalidToken => StatusCode::UNAUTHORIZED,
            DispatchError::Forbidden => StatusCode::FORBIDDEN,
            DispatchError::MissingField(_)
            | DispatchError::InvalidYaml(_)
            | DispatchError::UnsafeCode(_)
            | DispatchError::IrrelevantCode(_)
            | DispatchError::AlreadyTerminal(_) => StatusCode::BAD_REQUEST,
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::RateLimited(_) | DispatchError::QueueLimit(_) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if let DispatchError::Internal(ref e) = self {
            tracing::error!(error = %e, "internal error reached HTTP boundary");
        }

        let body = Json(json!({ "detail": self.to_string() }));
        (status, body).into_response()
    }
}
