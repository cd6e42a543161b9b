//! Common error types shared by the resilience layer and its callers
//!
//! # Error Handling Architecture
//!
//! 1. **`CommonError`**: standard error patterns that appear across backend
//!    integrations (timeouts, rate limiting, configuration, validation).
//!
//! 2. **`ErrorClassification` trait**: a standard interface for classifying
//!    errors by retryability, severity and criticality. The resilience layer's
//!    own `Classify` trait builds on it for `CommonError`.
//!
//! 3. **`ErrorSeverity` enum**: a unified severity level for monitoring and
//!    alerting.
//!
//! Backend-specific errors should **compose** with `CommonError` rather than
//! duplicate its variants:
//!
//! ```rust,ignore
//! #[derive(Debug, Error)]
//! pub enum IndexerError {
//!     #[error("Indexer crashed: {0}")]
//!     ServerCrashed(String),
//!
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//! }
//!
//! impl_error_classification!(IndexerError, Common,
//!     Self::ServerCrashed(_) => {
//!         retryable: true,
//!         severity: ErrorSeverity::Error,
//!         critical: false,
//!     }
//! );
//! ```
//!
//! | Pattern | CommonError Variant |
//! |---------|-------------------|
//! | **Circuit Breaker** | `CircuitBreakerOpen` |
//! | **Rate Limiting** | `RateLimitExceeded` |
//! | **Timeouts** | `Timeout` |
//! | **Serialization** | `Serialization` |
//! | **Validation** | `Validation` |
//! | **Configuration** | `Config` |
//! | **Backend** | `Backend` |
//! | **File I/O** | `Persistence` |
//! | **Internal** | `Internal` |

use std::fmt;
use std::time::Duration;

/// Standard result type using CommonError
pub type CommonResult<T> = Result<T, CommonError>;

/// Common error variants that appear across backend integrations
#[derive(Debug, Clone)]
pub enum CommonError {
    /// Configuration-related errors
    Config { message: String, field: Option<String> },

    /// Circuit breaker is open, preventing operations
    CircuitBreakerOpen { service: String, retry_after: Option<Duration> },

    /// Serialization or deserialization errors
    Serialization { message: String, format: Option<String> },

    /// File I/O errors
    Persistence { message: String },

    /// Rate limiting errors
    RateLimitExceeded {
        limit: Option<u32>,
        window: Option<Duration>,
        retry_after: Option<Duration>,
    },

    /// Timeout errors
    Timeout { operation: String, duration: Duration },

    /// Network or backend connectivity errors
    Backend { service: String, message: String, is_retryable: bool },

    /// Validation errors
    Validation { field: String, message: String, value: Option<String> },

    /// Internal errors that shouldn't normally occur
    Internal { message: String, context: Option<String> },
}

impl fmt::Display for CommonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message, field } => {
                if let Some(field) = field {
                    write!(f, "Configuration error in field '{}': {}", field, message)
                } else {
                    write!(f, "Configuration error: {}", message)
                }
            }
            Self::CircuitBreakerOpen { service, retry_after } => {
                if let Some(retry) = retry_after {
                    write!(f, "Circuit breaker open for '{}' (retry in {:?})", service, retry)
                } else {
                    write!(f, "Circuit breaker open for '{}'", service)
                }
            }
            Self::Serialization { message, format } => {
                if let Some(format) = format {
                    write!(f, "Serialization error ({}): {}", format, message)
                } else {
                    write!(f, "Serialization error: {}", message)
                }
            }
            Self::Persistence { message } => write!(f, "Persistence error: {}", message),
            Self::RateLimitExceeded { limit, window, retry_after } => {
                let mut msg = "Rate limit exceeded".to_string();
                if let (Some(limit), Some(window)) = (limit, window) {
                    msg.push_str(&format!(": {} requests per {:?}", limit, window));
                }
                if let Some(retry) = retry_after {
                    msg.push_str(&format!(" (retry in {:?})", retry));
                }
                write!(f, "{}", msg)
            }
            Self::Timeout { operation, duration } => {
                write!(f, "Operation '{}' timed out after {:?}", operation, duration)
            }
            Self::Backend { service, message, .. } => {
                write!(f, "Backend error from '{}': {}", service, message)
            }
            Self::Validation { field, message, value } => {
                if let Some(value) = value {
                    write!(
                        f,
                        "Validation error for field '{}' (value: '{}'): {}",
                        field, value, message
                    )
                } else {
                    write!(f, "Validation error for field '{}': {}", field, message)
                }
            }
            Self::Internal { message, context } => {
                if let Some(ctx) = context {
                    write!(f, "Internal error in '{}': {}", ctx, message)
                } else {
                    write!(f, "Internal error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for CommonError {}

impl ErrorClassification for CommonError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitBreakerOpen { .. } => true,
            Self::RateLimitExceeded { .. } => true,
            Self::Timeout { .. } => true,
            Self::Backend { is_retryable, .. } => *is_retryable,
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Config { .. } => ErrorSeverity::Error,
            Self::CircuitBreakerOpen { .. } => ErrorSeverity::Warning,
            Self::Serialization { .. } => ErrorSeverity::Error,
            Self::Persistence { .. } => ErrorSeverity::Error,
            Self::RateLimitExceeded { .. } => ErrorSeverity::Warning,
            Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::Backend { .. } => ErrorSeverity::Error,
            Self::Validation { .. } => ErrorSeverity::Error,
            Self::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitBreakerOpen { retry_after, .. } => *retry_after,
            Self::RateLimitExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl CommonError {
    /// Create a simple configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), field: None }
    }

    /// Create a configuration error for a specific field
    pub fn config_field<S: Into<String>, F: Into<String>>(field: F, message: S) -> Self {
        Self::Config { message: message.into(), field: Some(field.into()) }
    }

    /// Create a circuit breaker error with optional retry timing
    pub fn circuit_breaker<S: Into<String>>(service: S, retry_after: Option<Duration>) -> Self {
        Self::CircuitBreakerOpen { service: service.into(), retry_after }
    }

    /// Create a serialization error with format information
    pub fn serialization_format<S: Into<String>, F: Into<String>>(format: F, message: S) -> Self {
        Self::Serialization { message: message.into(), format: Some(format.into()) }
    }

    /// Create a simple rate limit error
    pub fn rate_limit(retry_after: Option<Duration>) -> Self {
        Self::RateLimitExceeded { limit: None, window: None, retry_after }
    }

    /// Create a rate limit error with details
    pub fn rate_limit_detailed(
        limit: u32,
        window: Duration,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::RateLimitExceeded { limit: Some(limit), window: Some(window), retry_after }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    /// Create a backend error
    pub fn backend<S: Into<String>, M: Into<String>>(
        service: S,
        message: M,
        is_retryable: bool,
    ) -> Self {
        Self::Backend { service: service.into(), message: message.into(), is_retryable }
    }

    /// Create a validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation { field: field.into(), message: message.into(), value: None }
    }

    /// Create a validation error with the invalid value
    pub fn validation_with_value<F: Into<String>, M: Into<String>, V: Into<String>>(
        field: F,
        message: M,
        value: V,
    ) -> Self {
        Self::Validation { field: field.into(), message: message.into(), value: Some(value.into()) }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), context: None }
    }
}

/// Trait for classifying errors by their characteristics
///
/// Implemented by every error type that crosses a backend boundary so retry,
/// alerting and health decisions use one vocabulary.
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient issues that may succeed if attempted
    /// again: timeouts, rate limiting, open circuits, temporary service
    /// unavailability.
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    ///
    /// Returns `Some(Duration)` when a specific delay is recommended (for
    /// example from a Retry-After header).
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

// Standard conversions from common error types
impl From<serde_json::Error> for CommonError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_format("JSON", err.to_string())
    }
}

impl From<std::io::Error> for CommonError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence { message: err.to_string() }
    }
}

#[cfg(feature = "foundation")]
impl From<toml::de::Error> for CommonError {
    fn from(err: toml::de::Error) -> Self {
        Self::serialization_format("TOML", err.to_string())
    }
}

/// Macro to implement ErrorClassification by delegating to CommonError
///
/// Variants without a `retry_after` entry report `None`. Bindings used by
/// the entry expressions should start with `_`, since every method matches
/// the same patterns.
///
/// ```rust,ignore
/// impl_error_classification!(MyError, Common,
///     Self::Specific { code: _code, .. } => {
///         retryable: *_code >= 500,
///         severity: ErrorSeverity::Error,
///         critical: false,
///     }
/// );
/// ```
#[macro_export]
macro_rules! impl_error_classification {
    (
        $error_type:ty,
        $common_variant:ident
        $(,
            $variant:pat => {
                retryable: $retryable:expr,
                severity: $severity:expr,
                critical: $critical:expr
                $(, retry_after: $retry_after:expr)?
                $(,)?
            }
        )*
        $(,)?
    ) => {
        impl $crate::error::ErrorClassification for $error_type {
            fn is_retryable(&self) -> bool {
                match self {
                    Self::$common_variant(e) => e.is_retryable(),
                    $(
                        $variant => $retryable,
                    )*
                }
            }

            fn severity(&self) -> $crate::error::ErrorSeverity {
                match self {
                    Self::$common_variant(e) => e.severity(),
                    $(
                        $variant => $severity,
                    )*
                }
            }

            fn is_critical(&self) -> bool {
                match self {
                    Self::$common_variant(e) => e.is_critical(),
                    $(
                        $variant => $critical,
                    )*
                }
            }

            fn retry_after(&self) -> Option<std::time::Duration> {
                match self {
                    Self::$common_variant(e) => e.retry_after(),
                    $(
                        $(
                            $variant => $retry_after,
                        )?
                    )*
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }
    };
}
