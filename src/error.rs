use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    #[error("Coalescing timeout: {0}")]
    CoalescingTimeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::BackendError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::CoalescingTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &str {
        match self {
            ProxyError::BackendError(msg)
            | ProxyError::BackendTimeout(msg)
            | ProxyError::CoalescingTimeout(msg)
            | ProxyError::InvalidRequest(msg)
            | ProxyError::ConfigError(msg)
            | ProxyError::Internal(msg) => msg,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = Json(json!({
            "error": status.canonical_reason().unwrap_or("Error"),
            "reason": self.reason(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::BackendTimeout(format!("Upstream timeout: {}", err))
        } else if err.is_connect() {
            ProxyError::BackendError(format!("Upstream unreachable: {}", err))
        } else {
            ProxyError::BackendError(err.to_string())
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Failures of the shared key-value store.
///
/// These never reach a client directly: the cache path treats them as misses
/// and the lock path falls back to uncoordinated fetching.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::BackendError("boom".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::BackendTimeout("slow".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyError::CoalescingTimeout("waited".into()).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::Connection("refused".to_string());
        assert_eq!(err.to_string(), "connection error: refused");

        let err = ProxyError::CoalescingTimeout("abc".to_string());
        assert_eq!(err.to_string(), "Coalescing timeout: abc");
    }
}
