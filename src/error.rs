//! Normalized error types for API calls.
//!
//! Every failure the client can produce (connection refused, timeout, HTTP
//! error body, malformed JSON) is normalized into a single [`ApiError`]
//! carrying a machine-readable [`ErrorCode`]. Downstream logic (the retry
//! predicate, the 401 handler, log rendering) branches on the code rather
//! than on concrete error types.

use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Stable error taxonomy shared by every component.
///
/// The code is always set; when the backend supplies its own code string it
/// takes precedence over the status-derived classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Connectivity, DNS, or transport failure. Always carries status 0.
    NetworkError,
    /// Client-side deadline or cancellation. Carries status 408.
    Timeout,
    Unauthorized,
    Forbidden,
    NotFound,
    /// 400/422 with optional field-level details.
    ValidationError,
    /// 429, may carry a Retry-After hint.
    RateLimited,
    /// Any 5xx.
    ServerError,
    UnknownError,
}

impl ErrorCode {
    /// Classifies an HTTP status code.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            400 | 422 => ErrorCode::ValidationError,
            401 => ErrorCode::Unauthorized,
            403 => ErrorCode::Forbidden,
            404 => ErrorCode::NotFound,
            408 => ErrorCode::Timeout,
            429 => ErrorCode::RateLimited,
            500..=599 => ErrorCode::ServerError,
            _ => ErrorCode::UnknownError,
        }
    }

    /// Parses a backend-supplied code string, e.g. `"VALIDATION_ERROR"`.
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "NETWORK_ERROR" => Some(ErrorCode::NetworkError),
            "TIMEOUT" => Some(ErrorCode::Timeout),
            "UNAUTHORIZED" => Some(ErrorCode::Unauthorized),
            "FORBIDDEN" => Some(ErrorCode::Forbidden),
            "NOT_FOUND" => Some(ErrorCode::NotFound),
            "VALIDATION_ERROR" => Some(ErrorCode::ValidationError),
            "RATE_LIMITED" => Some(ErrorCode::RateLimited),
            "SERVER_ERROR" => Some(ErrorCode::ServerError),
            "UNKNOWN_ERROR" => Some(ErrorCode::UnknownError),
            _ => None,
        }
    }

    /// The wire spelling of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON error body the backend sends for non-2xx responses.
///
/// All fields are optional; an absent or unparseable body falls back to the
/// HTTP status text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// The normalized error produced by every failing client call.
///
/// Invariants: `code` is always set; `status` is `0` exactly when the failure
/// never produced an HTTP response (transport, timeout, cancellation, or a
/// local failure such as a full offline queue).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code} ({status}): {message}")]
pub struct ApiError {
    /// Machine-readable classification.
    pub code: ErrorCode,
    /// HTTP status, or 0 for non-HTTP failures.
    pub status: u16,
    /// Human-readable description.
    pub message: String,
    /// Structured payload from the error body, e.g. field-level validation
    /// errors.
    pub details: Option<serde_json::Value>,
    /// Server-suggested wait before retrying, parsed from the Retry-After
    /// header on 429 responses.
    pub retry_after: Option<Duration>,
    /// When the error was created, unix milliseconds.
    pub timestamp_ms: u64,
}

impl ApiError {
    fn base(code: ErrorCode, status: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status,
            message: message.into(),
            details: None,
            retry_after: None,
            timestamp_ms: now_ms(),
        }
    }

    /// A transport-level failure (connection refused, DNS, TLS).
    pub fn network(message: impl Into<String>) -> Self {
        Self::base(ErrorCode::NetworkError, 0, message)
    }

    /// A client-side deadline or cancellation.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::base(ErrorCode::Timeout, 408, message)
    }

    /// A local failure with no HTTP counterpart (configuration, storage,
    /// serialization).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::base(ErrorCode::UnknownError, 0, message)
    }

    /// Normalizes a transport error from reqwest.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout("request timed out")
        } else {
            Self::network(err.to_string())
        }
    }

    /// Normalizes a non-2xx response.
    ///
    /// Prefers the parsed error body's code/message/details; falls back to
    /// the status text. 429 responses pick up a Retry-After hint.
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: Option<ErrorBody>) -> Self {
        let body = body.unwrap_or_default();
        let code = body
            .code
            .as_deref()
            .and_then(ErrorCode::parse)
            .unwrap_or_else(|| ErrorCode::from_status(status));
        let message = body.message.unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });

        let mut err = Self::base(code, status.as_u16(), message);
        err.details = body.details;
        if status.as_u16() == 429 {
            err.retry_after = parse_retry_after(headers);
        }
        err
    }

    /// Returns `true` if the retry engine may re-attempt the operation.
    ///
    /// Retryable iff the status is one of 408/429/500/502/503/504 or the code
    /// is NETWORK_ERROR, TIMEOUT, or SERVER_ERROR. Unclassified errors whose
    /// message merely mentions "network" are deliberately not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status, 408 | 429 | 500 | 502 | 503 | 504)
            || matches!(
                self.code,
                ErrorCode::NetworkError | ErrorCode::Timeout | ErrorCode::ServerError
            )
    }
}

/// A specialized `Result` for API calls.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Current time as unix milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Parses the Retry-After header, in both delay-seconds and HTTP-date forms.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get("retry-after")?.to_str().ok()?;

    if let Ok(seconds) = header.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    if let Ok(date_time) = httpdate::parse_http_date(header) {
        if let Ok(duration) = date_time.duration_since(SystemTime::now()) {
            return Some(duration);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn status_classification() {
        assert_eq!(
            ErrorCode::from_status(StatusCode::UNAUTHORIZED),
            ErrorCode::Unauthorized
        );
        assert_eq!(
            ErrorCode::from_status(StatusCode::UNPROCESSABLE_ENTITY),
            ErrorCode::ValidationError
        );
        assert_eq!(
            ErrorCode::from_status(StatusCode::BAD_REQUEST),
            ErrorCode::ValidationError
        );
        assert_eq!(
            ErrorCode::from_status(StatusCode::BAD_GATEWAY),
            ErrorCode::ServerError
        );
        assert_eq!(
            ErrorCode::from_status(StatusCode::IM_A_TEAPOT),
            ErrorCode::UnknownError
        );
    }

    #[test]
    fn body_code_takes_precedence_over_status() {
        let body = ErrorBody {
            code: Some("RATE_LIMITED".to_string()),
            message: Some("slow down".to_string()),
            details: None,
        };
        let err = ApiError::from_response(StatusCode::BAD_REQUEST, &HeaderMap::new(), Some(body));
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert_eq!(err.status, 400);
        assert_eq!(err.message, "slow down");
    }

    #[test]
    fn status_text_fallback_when_body_absent() {
        let err = ApiError::from_response(StatusCode::NOT_FOUND, &HeaderMap::new(), None);
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.message, "Not Found");
    }

    #[test]
    fn retry_after_seconds_on_429() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("42"));
        let err = ApiError::from_response(StatusCode::TOO_MANY_REQUESTS, &headers, None);
        assert_eq!(err.retry_after, Some(Duration::from_secs(42)));
        assert!(err.is_retryable());
    }

    #[test]
    fn retryable_taxonomy() {
        assert!(ApiError::network("refused").is_retryable());
        assert!(ApiError::timeout("deadline").is_retryable());
        assert!(
            ApiError::from_response(StatusCode::SERVICE_UNAVAILABLE, &HeaderMap::new(), None)
                .is_retryable()
        );
        assert!(
            !ApiError::from_response(StatusCode::UNPROCESSABLE_ENTITY, &HeaderMap::new(), None)
                .is_retryable()
        );
        assert!(
            !ApiError::from_response(StatusCode::UNAUTHORIZED, &HeaderMap::new(), None)
                .is_retryable()
        );
        // A message mentioning "network" is not enough on its own.
        let mut err = ApiError::from_response(StatusCode::CONFLICT, &HeaderMap::new(), None);
        err.message = "network configuration rejected".to_string();
        assert!(!err.is_retryable());
    }

    #[test]
    fn network_errors_carry_status_zero() {
        let err = ApiError::network("connection refused");
        assert_eq!(err.status, 0);
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert!(err.timestamp_ms > 0);
    }
}
