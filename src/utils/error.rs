//! Error handling module
//!
//! Defines the relay error kinds and their uniform client-facing shape

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relay error kinds
#[derive(Error, Debug)]
pub enum RelayError {
    /// Malformed or unsupported inbound payload
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Caller could not be authenticated
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// No channel serves the requested model for the caller's group
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// No adaptor exists for the resolved backend
    #[error("Invalid api type: {0}")]
    UnsupportedApiType(String),

    /// Reservation denied by the quota ledger
    #[error("Insufficient quota: {0}")]
    QuotaInsufficient(String),

    /// Transport-level failure calling the backend
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Backend returned a structured error payload
    #[error("{message}")]
    UpstreamProtocol {
        status: StatusCode,
        code: String,
        message: String,
    },

    /// Adaptor cannot express a request feature
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Channel routing data is missing or invalid
    #[error("Channel configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local failure (body read, task join, ...)
    #[error("Internal error: {0}")]
    Internal(String),

    /// The client went away while the reply was being produced
    #[error("Client disconnected")]
    ClientDisconnected,
}

/// Uniform error value returned to callers: `{httpStatus, code, message}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorWithStatusCode {
    pub status: StatusCode,
    pub code: String,
    pub error_type: String,
    pub message: String,
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error message
    pub message: String,
    /// Error type
    #[serde(rename = "type")]
    pub error_type: String,
    /// Machine readable code
    pub code: String,
}

impl RelayError {
    /// Get HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::InvalidRequest(_)
            | RelayError::UnsupportedApiType(_)
            | RelayError::UnsupportedFeature(_) => StatusCode::BAD_REQUEST,
            RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RelayError::QuotaInsufficient(_) => StatusCode::FORBIDDEN,
            RelayError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            RelayError::UpstreamProtocol { status, .. } => *status,
            RelayError::ClientDisconnected => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            RelayError::Configuration(_)
            | RelayError::Serialization(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get machine readable error code
    pub fn code(&self) -> &str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_text_request",
            RelayError::Unauthorized(_) => "invalid_api_key",
            RelayError::ModelUnavailable(_) => "model_not_found",
            RelayError::UnsupportedApiType(_) => "invalid_api_type",
            RelayError::QuotaInsufficient(_) => "insufficient_user_quota",
            RelayError::UpstreamUnreachable(_) => "do_request_failed",
            RelayError::UpstreamProtocol { code, .. } => code,
            RelayError::UnsupportedFeature(_) => "unsupported_feature",
            RelayError::Configuration(_) => "channel_config_error",
            RelayError::Serialization(_) => "json_marshal_failed",
            RelayError::Internal(_) => "internal_error",
            RelayError::ClientDisconnected => "client_closed_request",
        }
    }

    /// Get error type string
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_)
            | RelayError::UnsupportedApiType(_)
            | RelayError::UnsupportedFeature(_) => "invalid_request_error",
            RelayError::Unauthorized(_) => "authentication_error",
            RelayError::QuotaInsufficient(_) => "insufficient_quota",
            RelayError::ModelUnavailable(_) => "unavailable_error",
            RelayError::UpstreamUnreachable(_) | RelayError::UpstreamProtocol { .. } => "upstream_error",
            RelayError::Configuration(_)
            | RelayError::Serialization(_)
            | RelayError::Internal(_)
            | RelayError::ClientDisconnected => "relay_error",
        }
    }

    /// Whether detailed error information should be logged
    pub fn should_log_details(&self) -> bool {
        !matches!(self, RelayError::Unauthorized(_) | RelayError::ClientDisconnected)
    }

    /// Convert to the uniform error value
    pub fn to_uniform(&self) -> ErrorWithStatusCode {
        ErrorWithStatusCode {
            status: self.status_code(),
            code: self.code().to_string(),
            error_type: self.error_type().to_string(),
            message: self.to_string(),
        }
    }
}

impl ErrorWithStatusCode {
    /// Wire body for this error
    pub fn to_response_body(&self) -> ErrorResponse {
        ErrorResponse {
            error: ErrorBody {
                message: self.message.clone(),
                error_type: self.error_type.clone(),
                code: self.code.clone(),
            },
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let uniform = self.to_uniform();

        if self.should_log_details() {
            tracing::error!("Relay error: {} - Status code: {}", self, uniform.status);
        } else {
            tracing::warn!("Client error: {} - Status code: {}", uniform.code, uniform.status);
        }

        (uniform.status, Json(uniform.to_response_body())).into_response()
    }
}

/// Result type alias
pub type RelayResult<T> = Result<T, RelayError>;

/// Error context extension trait
pub trait ErrorContext<T> {
    /// Add invalid request context
    fn invalid_request_context(self, message: &str) -> RelayResult<T>;

    /// Add upstream transport context
    fn unreachable_context(self, message: &str) -> RelayResult<T>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: std::fmt::Display,
{
    fn invalid_request_context(self, message: &str) -> RelayResult<T> {
        self.map_err(|e| RelayError::InvalidRequest(format!("{}: {}", message, e)))
    }

    fn unreachable_context(self, message: &str) -> RelayResult<T> {
        self.map_err(|e| RelayError::UpstreamUnreachable(format!("{}: {}", message, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(RelayError::InvalidRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(RelayError::QuotaInsufficient("x".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(RelayError::UpstreamUnreachable("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(RelayError::Internal("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(RelayError::ClientDisconnected.status_code().as_u16(), 499);
    }

    #[test]
    fn test_upstream_protocol_keeps_upstream_status_and_code() {
        let err = RelayError::UpstreamProtocol {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "rate_limit_exceeded".to_string(),
            message: "slow down".to_string(),
        };
        let uniform = err.to_uniform();
        assert_eq!(uniform.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(uniform.code, "rate_limit_exceeded");
        assert_eq!(uniform.message, "slow down");
    }

    #[test]
    fn test_error_context() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof"
        ));

        match result.invalid_request_context("Failed to parse body") {
            Err(RelayError::InvalidRequest(msg)) => {
                assert!(msg.contains("Failed to parse body"));
                assert!(msg.contains("eof"));
            }
            other => panic!("Expected invalid request error, got {:?}", other),
        }
    }
}
