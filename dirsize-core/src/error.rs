//! Standardized error handling for the control surface.
//!
//! Internal errors never leak past here: `ApiError` maps `dirsize_common::Error`
//! and the storage/serde error types into a status code, a machine-readable
//! code, and a caller-safe message.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(status: u16, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: message.into(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    UpstreamAuth(String),
    UpstreamUnavailable(String),
    UpstreamApi { code: i64, message: String },
    GatewayTimeout(String),
    Internal(String),
}

impl ApiError {
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            ApiError::BadRequest(msg) => ErrorResponse::new(400, "BAD_REQUEST", msg),
            ApiError::NotFound(msg) => ErrorResponse::new(404, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => ErrorResponse::new(409, "CONFLICT", msg),
            ApiError::UpstreamAuth(msg) => {
                ErrorResponse::new(502, "UPSTREAM_AUTH_FAILED", "NAS authentication failed")
                    .with_details(msg)
            }
            ApiError::UpstreamUnavailable(msg) => {
                ErrorResponse::new(503, "UPSTREAM_UNAVAILABLE", "NAS is unreachable")
                    .with_details(msg)
            }
            ApiError::UpstreamApi { code, message } => ErrorResponse::new(
                502,
                "UPSTREAM_API_ERROR",
                "NAS reported an API error",
            )
            .with_details(format!("code {code}: {message}")),
            ApiError::GatewayTimeout(msg) => {
                ErrorResponse::new(504, "GATEWAY_TIMEOUT", msg)
            }
            ApiError::Internal(msg) => {
                error!("internal API error: {}", msg);
                ErrorResponse::new(500, "INTERNAL_ERROR", "An internal error occurred")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.to_error_response();
        let status = StatusCode::from_u16(body.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

impl From<dirsize_common::Error> for ApiError {
    fn from(err: dirsize_common::Error) -> Self {
        use dirsize_common::Error as E;
        match err {
            E::ConfigError(msg) => ApiError::BadRequest(msg),
            E::AuthError(msg) => ApiError::UpstreamAuth(msg),
            E::TransportError(msg) => ApiError::UpstreamUnavailable(msg),
            E::ApiError { code, message } => ApiError::UpstreamApi { code, message },
            E::LostTaskError => ApiError::GatewayTimeout("scan task lost on the NAS".to_string()),
            E::TimeoutError => ApiError::GatewayTimeout("scan task timed out".to_string()),
            E::CancelledError => ApiError::Conflict("scan was cancelled".to_string()),
            E::StorageError(msg) => {
                error!("storage error: {}", msg);
                ApiError::Internal(msg)
            }
            E::Io(e) => {
                error!("io error: {}", e);
                ApiError::Internal(format!("io error: {e}"))
            }
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("invalid JSON: {err}"))
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        error!("database error: {}", err);
        ApiError::Internal("database error occurred".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_maps_to_bad_request() {
        let err: ApiError = dirsize_common::Error::ConfigError("bad scan".into()).into();
        assert_eq!(err.to_error_response().status, 400);
    }

    #[test]
    fn auth_error_maps_to_bad_gateway() {
        let err: ApiError = dirsize_common::Error::AuthError("denied".into()).into();
        assert_eq!(err.to_error_response().status, 502);
    }

    #[test]
    fn lost_task_maps_to_gateway_timeout() {
        let err: ApiError = dirsize_common::Error::LostTaskError.into();
        assert_eq!(err.to_error_response().status, 504);
    }

    #[test]
    fn cancelled_maps_to_conflict() {
        let err: ApiError = dirsize_common::Error::CancelledError.into();
        assert_eq!(err.to_error_response().status, 409);
    }

    #[test]
    fn storage_error_hides_detail_behind_generic_message() {
        let err: ApiError = dirsize_common::Error::StorageError("disk full".into()).into();
        let resp = err.to_error_response();
        assert_eq!(resp.status, 500);
        assert_eq!(resp.message, "An internal error occurred");
    }
}
