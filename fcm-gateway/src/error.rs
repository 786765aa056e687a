//! Error types for the gateway crate.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fcm_executor::{ErrorKind, ExecutorError};
use serde_json::json;

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// An error propagated from the executor layer.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// No record exists for the named VM.
    #[error("VM not found: {0}")]
    NotFound(String),

    /// The request body is malformed or contains invalid values.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A destructive call was made without `force=true`.
    #[error("confirmation required: {0}")]
    ConfirmationRequired(String),

    /// The task running the operation panicked or was cancelled.
    #[error("operation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl GatewayError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Executor(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::ResourceConflict | ErrorKind::State => StatusCode::CONFLICT,
                ErrorKind::ExternalTool | ErrorKind::Api => StatusCode::BAD_GATEWAY,
                ErrorKind::Interrupted | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::ConfirmationRequired(_) => StatusCode::CONFLICT,
            GatewayError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({"error": self.to_string()}))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[test]
    fn gateway_error_status_codes_map_correctly() {
        let not_found = GatewayError::NotFound("t1".to_owned());
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let bad_req = GatewayError::InvalidRequest("missing field".to_owned());
        assert_eq!(bad_req.into_response().status(), StatusCode::BAD_REQUEST);

        let unforced = GatewayError::ConfirmationRequired("t1".to_owned());
        assert_eq!(unforced.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn executor_errors_map_by_kind() {
        let cases = [
            (ExecutorError::Validation("bad".to_owned()), StatusCode::BAD_REQUEST),
            (
                ExecutorError::ResourceConflict { resource: "tap0".to_owned(), reason: "exists".to_owned() },
                StatusCode::CONFLICT,
            ),
            (ExecutorError::State { vm: "t1".to_owned(), reason: "running".to_owned() }, StatusCode::CONFLICT),
            (
                ExecutorError::Api { step: "boot-source", reason: "HTTP 400".to_owned() },
                StatusCode::BAD_GATEWAY,
            ),
            (
                ExecutorError::ExternalTool { tool: "ip".to_owned(), reason: "timed out".to_owned() },
                StatusCode::BAD_GATEWAY,
            ),
            (ExecutorError::Interrupted, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            let msg = err.to_string();
            assert_eq!(GatewayError::from(err).status(), expected, "wrong status for {msg}");
        }
    }

    #[test]
    fn gateway_error_display_includes_message() {
        let err = GatewayError::InvalidRequest("bad kernel".to_owned());
        let msg = err.to_string();
        assert!(msg.contains("bad kernel"), "Display must include the message");
    }
}
