//! # Error Handling
//!
//! `AppError` is what HTTP handlers return. Each variant maps to a status
//! code and renders as
//! `{"error": {"type": ..., "message": ..., "timestamp": ...}}`.
//!
//! The WebSocket side never uses it: client-facing failures there are
//! `ERROR` envelopes.

use crate::relay::RelayError;
use crate::upstream::UpstreamError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Internal(String),

    BadRequest(String),

    /// The translation backend cannot take the request right now.
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::ServiceUnavailable(msg) => ("service_unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Encode(msg) => AppError::Internal(msg),
            other => AppError::ServiceUnavailable(other.to_string()),
        }
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Upstream(upstream) => upstream.into(),
            RelayError::QueueFull(_) => AppError::ServiceUnavailable(err.to_string()),
            RelayError::UnknownSession(_) => AppError::BadRequest(err.to_string()),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;

    #[actix_web::test]
    async fn test_error_response_body() {
        let err = AppError::from(UpstreamError::NotConnected);
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let response = err.error_response();
        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["type"], "service_unavailable");
        assert_eq!(
            value["error"]["message"],
            "translation backend is not connected"
        );
        assert!(value["error"]["timestamp"].is_string());
    }

    #[test]
    fn test_relay_error_mapping() {
        assert_eq!(
            AppError::from(RelayError::QueueFull(4)).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::from(RelayError::UnknownSession("x".to_string())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(UpstreamError::Encode("bad".to_string())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
