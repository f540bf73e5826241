use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use thiserror::Error;

use crate::relay::body::{full, RelayBody};

/// Unified error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    // Admission errors
    #[error("Disallowed URL.")]
    DisallowedContent,

    #[error("Header \"origin\" is required.")]
    MissingOrigin,

    #[error("Rate limited. Next available in {retry_after_ms} ms.")]
    RateLimited { retry_after_ms: u64 },

    #[error("All proxies are cooling down. Next available in {wait_ms} ms.")]
    ProxyPoolExhausted { wait_ms: u64 },

    #[error("Server is busy! Please try again later.")]
    Overloaded,

    // Upstream errors
    #[error("Maximum allowed size is {limit} bytes.")]
    PayloadTooLarge { limit: u64 },

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(#[from] reqwest::Error),

    // Request errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 403 Forbidden
            RelayError::DisallowedContent | RelayError::MissingOrigin => StatusCode::FORBIDDEN,

            // 404 Not Found
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,

            // 405 Method Not Allowed
            RelayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,

            // 413 Payload Too Large
            RelayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // 429 Too Many Requests
            RelayError::RateLimited { .. } | RelayError::ProxyPoolExhausted { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }

            // 502 Bad Gateway
            RelayError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            RelayError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            RelayError::InvalidConfig(_)
            | RelayError::Tls(_)
            | RelayError::Io(_)
            | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Milliseconds the client should wait before retrying, if any
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            RelayError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            RelayError::ProxyPoolExhausted { wait_ms } => Some(*wait_ms),
            _ => None,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Render the error as a plain-text response readable from a browser
    pub fn into_response(self) -> Response<RelayBody> {
        let status = self.status_code();

        // 429 bodies carry the bare wait time so scripts can parse it.
        let (body, retry_after) = match self.retry_after_ms() {
            Some(ms) => (ms.to_string(), Some(ms.div_ceil(1000))),
            None => (self.to_string(), None),
        };

        let mut response = Response::new(full(body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        if let Some(secs) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }

        response
    }
}

impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::InvalidRequest(err.to_string())
    }
}

impl From<rustls::Error> for RelayError {
    fn from(err: rustls::Error) -> Self {
        RelayError::Tls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            RelayError::DisallowedContent.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(RelayError::MissingOrigin.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            RelayError::RateLimited { retry_after_ms: 10 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            RelayError::ProxyPoolExhausted { wait_ms: 10 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            RelayError::PayloadTooLarge { limit: 1 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            RelayError::Overloaded.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RelayError::NotFound("/".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_error_client_server_helpers() {
        assert!(RelayError::MissingOrigin.is_client_error());
        assert!(!RelayError::MissingOrigin.is_server_error());

        assert!(RelayError::Overloaded.is_server_error());
        assert!(!RelayError::Overloaded.is_client_error());
    }

    #[tokio::test]
    async fn test_rate_limited_response_body_is_wait_time() {
        let response = RelayError::RateLimited {
            retry_after_ms: 1500,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "2");
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"1500");
    }

    #[tokio::test]
    async fn test_forbidden_response_body_is_message() {
        let response = RelayError::MissingOrigin.into_response();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Header \"origin\" is required.");
    }
}
