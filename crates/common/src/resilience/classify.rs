//! Error classification for retry and circuit decisions
//!
//! Every failed attempt is mapped to an [`ErrorClass`] before the retry
//! executor decides whether to try again. Classification is exhaustive: an
//! error is either transient, rate-limited or fatal, and the mapping is
//! supplied either by the error type itself ([`Classify`]) or by a
//! per-category [`ErrorClassifier`] so a new backend never inherits another
//! backend's assumptions about status codes or messages.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CommonError, ErrorClassification};

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, refused connections, 5xx responses. Retry with backoff.
    Transient,
    /// 403/429 style throttling. Retry with backoff, honouring the server
    /// hint when one is present.
    RateLimited { retry_after: Option<Duration> },
    /// Validation failures, 404, malformed input. Never retried.
    Fatal,
}

impl ErrorClass {
    /// Whether the retry executor may attempt the operation again.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal)
    }

    /// Server-provided delay hint, if any.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable label for logs and metric labels.
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimited { .. } => "rate_limited",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors that can classify themselves.
pub trait Classify {
    /// Map this error to an [`ErrorClass`].
    fn classify(&self) -> ErrorClass;
}

/// Pluggable classification predicate, configured per backend category.
pub trait ErrorClassifier<E>: Send + Sync {
    /// Map `error` to an [`ErrorClass`].
    fn classify(&self, error: &E) -> ErrorClass;
}

/// Shared, type-erased classifier as stored by the registry.
pub type SharedClassifier<E> = Arc<dyn ErrorClassifier<E>>;

impl<E, T> ErrorClassifier<E> for Arc<T>
where
    T: ErrorClassifier<E> + ?Sized,
{
    fn classify(&self, error: &E) -> ErrorClass {
        (**self).classify(error)
    }
}

/// Delegates to the error's own [`Classify`] implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfClassifier;

impl<E: Classify> ErrorClassifier<E> for SelfClassifier {
    fn classify(&self, error: &E) -> ErrorClass {
        error.classify()
    }
}

/// Classifier backed by a closure.
pub struct FnClassifier<F> {
    predicate: F,
}

impl<F> FnClassifier<F> {
    /// Wrap `predicate` as a classifier.
    pub const fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> fmt::Debug for FnClassifier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnClassifier").finish_non_exhaustive()
    }
}

impl<E, F> ErrorClassifier<E> for FnClassifier<F>
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClass {
        (self.predicate)(error)
    }
}

/// Treats every error as transient.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl<E> ErrorClassifier<E> for AlwaysRetry {
    fn classify(&self, _error: &E) -> ErrorClass {
        ErrorClass::Transient
    }
}

/// Treats every error as fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl<E> ErrorClassifier<E> for NeverRetry {
    fn classify(&self, _error: &E) -> ErrorClass {
        ErrorClass::Fatal
    }
}

/// Default mapping of an HTTP status code.
///
/// 403 and 429 are throttling, 408 and 5xx are transient, every other status
/// is fatal.
pub const fn classify_http_status(status: u16) -> ErrorClass {
    match status {
        403 | 429 => ErrorClass::RateLimited { retry_after: None },
        408 | 500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

/// Default mapping of an I/O error kind.
pub fn classify_io_kind(kind: io::ErrorKind) -> ErrorClass {
    match kind {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::UnexpectedEof => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

impl Classify for io::Error {
    fn classify(&self) -> ErrorClass {
        classify_io_kind(self.kind())
    }
}

impl Classify for CommonError {
    fn classify(&self) -> ErrorClass {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => {
                ErrorClass::RateLimited { retry_after: *retry_after }
            }
            other if other.is_retryable() => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(classify_http_status(429), ErrorClass::RateLimited { retry_after: None });
        assert_eq!(classify_http_status(403), ErrorClass::RateLimited { retry_after: None });
        assert_eq!(classify_http_status(503), ErrorClass::Transient);
        assert_eq!(classify_http_status(408), ErrorClass::Transient);
        assert_eq!(classify_http_status(404), ErrorClass::Fatal);
        assert_eq!(classify_http_status(422), ErrorClass::Fatal);
    }

    #[test]
    fn test_io_error_classification() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let missing = io::Error::new(io::ErrorKind::NotFound, "missing");

        assert_eq!(refused.classify(), ErrorClass::Transient);
        assert_eq!(missing.classify(), ErrorClass::Fatal);
    }

    /// Validates classification of `CommonError` variants.
    ///
    /// Assertions:
    /// - Rate limits keep their retry hint.
    /// - Timeouts are transient.
    /// - Validation failures are fatal.
    #[test]
    fn test_common_error_classification() {
        let limited = CommonError::rate_limit_detailed(
            60,
            Duration::from_secs(60),
            Some(Duration::from_secs(2)),
        );
        assert_eq!(
            limited.classify(),
            ErrorClass::RateLimited { retry_after: Some(Duration::from_secs(2)) }
        );

        let timeout = CommonError::timeout("search", Duration::from_secs(1));
        assert_eq!(timeout.classify(), ErrorClass::Transient);

        let invalid = CommonError::validation("query", "empty");
        assert_eq!(invalid.classify(), ErrorClass::Fatal);
    }

    #[test]
    fn test_fn_classifier_and_shared() {
        let classifier: SharedClassifier<u16> =
            Arc::new(FnClassifier::new(|status: &u16| classify_http_status(*status)));
        assert_eq!(classifier.classify(&502), ErrorClass::Transient);
        assert_eq!(classifier.classify(&400), ErrorClass::Fatal);

        assert!(ErrorClassifier::<u16>::classify(&AlwaysRetry, &400).is_retryable());
        assert!(!ErrorClassifier::<u16>::classify(&NeverRetry, &503).is_retryable());
    }

    #[test]
    fn test_error_class_helpers() {
        let limited = ErrorClass::RateLimited { retry_after: Some(Duration::from_millis(10)) };
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_after(), Some(Duration::from_millis(10)));
        assert_eq!(limited.to_string(), "rate_limited");
        assert_eq!(ErrorClass::Fatal.retry_after(), None);
    }
}
