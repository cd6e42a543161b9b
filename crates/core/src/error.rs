//! Errors returned by backend operations
//!
//! Backend adapters (git host client, language server bridge, filesystem
//! indexer, package registry client) report failures as [`BackendError`].
//! The resilience layer reads them through [`Classify`]; callers reading
//! them directly can use [`ErrorClassification`].

use std::io;
use std::time::Duration;

use relaygate_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use relaygate_common::resilience::{classify_http_status, classify_io_kind, Classify, ErrorClass};
use thiserror::Error;

/// JSON-RPC error codes a language server uses for conditions that clear on
/// their own: server not yet initialized, request cancelled by the server,
/// content modified under the request.
pub const TRANSIENT_RPC_CODES: [i64; 3] = [-32002, -32801, -32802];

/// Failure reported by a backend operation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Common(#[from] CommonError),

    /// HTTP API returned a non-success status
    #[error("{service} returned HTTP {status}: {message}")]
    Http { service: String, status: u16, message: String, retry_after: Option<Duration> },

    /// Local or socket I/O failed
    #[error("{service} I/O failure: {source}")]
    Io {
        service: String,
        #[source]
        source: io::Error,
    },

    /// Language server answered with a JSON-RPC error
    #[error("Language server error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Backend did not answer in time
    #[error("{service} did not respond within {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    /// Request rejected before reaching the backend
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl BackendError {
    pub fn http<S: Into<String>, M: Into<String>>(service: S, status: u16, message: M) -> Self {
        Self::Http { service: service.into(), status, message: message.into(), retry_after: None }
    }

    /// HTTP failure carrying the server's `Retry-After` hint.
    pub fn http_with_retry_after<S: Into<String>, M: Into<String>>(
        service: S,
        status: u16,
        message: M,
        retry_after: Duration,
    ) -> Self {
        Self::Http {
            service: service.into(),
            status,
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn io<S: Into<String>>(service: S, source: io::Error) -> Self {
        Self::Io { service: service.into(), source }
    }

    pub fn rpc<M: Into<String>>(code: i64, message: M) -> Self {
        Self::Rpc { code, message: message.into() }
    }

    pub fn timeout<S: Into<String>>(service: S, timeout: Duration) -> Self {
        Self::Timeout { service: service.into(), timeout }
    }

    pub fn invalid_request<M: Into<String>>(message: M) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// HTTP status, when the failure came from an HTTP API.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Class of a JSON-RPC error code.
pub fn classify_rpc_code(code: i64) -> ErrorClass {
    if TRANSIENT_RPC_CODES.contains(&code) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

impl Classify for BackendError {
    fn classify(&self) -> ErrorClass {
        match self {
            Self::Common(err) => err.classify(),
            Self::Http { status, retry_after, .. } => match classify_http_status(*status) {
                ErrorClass::RateLimited { .. } => ErrorClass::RateLimited { retry_after: *retry_after },
                other => other,
            },
            Self::Io { source, .. } => classify_io_kind(source.kind()),
            Self::Rpc { code, .. } => classify_rpc_code(*code),
            Self::Timeout { .. } => ErrorClass::Transient,
            Self::InvalidRequest(_) => ErrorClass::Fatal,
        }
    }
}

relaygate_common::impl_error_classification!(BackendError, Common,
    Self::Http { status: _status, retry_after: _hint, .. } => {
        retryable: classify_http_status(*_status).is_retryable(),
        severity: if *_status >= 500 { ErrorSeverity::Error } else { ErrorSeverity::Warning },
        critical: false,
        retry_after: match classify_http_status(*_status) {
            ErrorClass::RateLimited { .. } => *_hint,
            _ => None,
        },
    },
    Self::Io { source: _source, .. } => {
        retryable: classify_io_kind(_source.kind()).is_retryable(),
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::Rpc { code: _code, .. } => {
        retryable: classify_rpc_code(*_code).is_retryable(),
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::Timeout { .. } => {
        retryable: true,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::InvalidRequest(_) => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    },
);

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_rate_limit_carries_hint() {
        let err = BackendError::http_with_retry_after(
            "git-host",
            429,
            "secondary rate limit",
            Duration::from_secs(12),
        );
        assert_eq!(err.classify(), ErrorClass::RateLimited { retry_after: Some(Duration::from_secs(12)) });
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert!(err.is_retryable());
        assert_eq!(err.status(), Some(429));
    }

    /// Validates the default classification of each variant.
    ///
    /// Assertions:
    /// - 5xx, timeouts and refused connections are transient.
    /// - 404, missing files and invalid requests are fatal.
    /// - Only the listed JSON-RPC codes are transient.
    #[test]
    fn test_variant_classification() {
        assert_eq!(BackendError::http("registry", 503, "unavailable").classify(), ErrorClass::Transient);
        assert_eq!(BackendError::http("registry", 404, "no such crate").classify(), ErrorClass::Fatal);
        assert_eq!(
            BackendError::io("indexer", io::Error::from(io::ErrorKind::ConnectionRefused)).classify(),
            ErrorClass::Transient
        );
        assert_eq!(
            BackendError::io("indexer", io::Error::from(io::ErrorKind::NotFound)).classify(),
            ErrorClass::Fatal
        );
        assert_eq!(BackendError::timeout("lsp", Duration::from_secs(5)).classify(), ErrorClass::Transient);
        assert_eq!(BackendError::invalid_request("empty query").classify(), ErrorClass::Fatal);
        assert_eq!(BackendError::rpc(-32801, "content modified").classify(), ErrorClass::Transient);
        assert_eq!(BackendError::rpc(-32601, "method not found").classify(), ErrorClass::Fatal);
    }

    #[test]
    fn test_common_errors_delegate() {
        let err = BackendError::from(CommonError::rate_limit(Some(Duration::from_secs(3))));
        assert_eq!(err.classify(), ErrorClass::RateLimited { retry_after: Some(Duration::from_secs(3)) });
        assert_eq!(err.severity(), ErrorSeverity::Warning);

        let err = BackendError::from(CommonError::validation("path", "must be relative"));
        assert!(!err.is_retryable());
    }

    /// Validates the `ErrorClassification` view of backend errors.
    ///
    /// Assertions:
    /// - Retryability agrees with the resilience classification.
    /// - Server errors are more severe than client errors.
    /// - Only rate-limited HTTP failures report their hint.
    #[test]
    fn test_error_classification_view() {
        let unavailable = BackendError::http_with_retry_after("registry", 503, "down", Duration::from_secs(9));
        assert!(unavailable.is_retryable());
        assert_eq!(unavailable.severity(), ErrorSeverity::Error);
        assert_eq!(unavailable.retry_after(), None);

        let missing = BackendError::http("registry", 404, "no such crate");
        assert!(!missing.is_retryable());
        assert_eq!(missing.severity(), ErrorSeverity::Warning);

        let refused = BackendError::io("indexer", io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(refused.is_retryable());
        assert!(!BackendError::rpc(-32601, "method not found").is_retryable());
        assert!(BackendError::rpc(-32002, "server not initialized").is_retryable());
        assert!(BackendError::timeout("lsp", Duration::from_secs(5)).is_retryable());
        assert_eq!(BackendError::invalid_request("empty").severity(), ErrorSeverity::Info);

        let internal = BackendError::from(CommonError::internal("bad state"));
        assert!(internal.is_critical());
        assert!(!refused.is_critical());
    }

    #[test]
    fn test_display() {
        let err = BackendError::http("git-host", 502, "bad gateway");
        assert_eq!(err.to_string(), "git-host returned HTTP 502: bad gateway");
        assert_eq!(
            BackendError::rpc(-32002, "server not initialized").to_string(),
            "Language server error -32002: server not initialized"
        );
    }
}
