//! Shared building blocks for RelayGate: errors, serde helpers and the
//! resilience layer that guards every backend call.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: errors and serde helpers
//! - `runtime`: async infrastructure (resilience layer, event reporting)
//! - `observability`: tracing and metrics (implied by `runtime`)

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod utils;

// Runtime tier
// --------------------------------------------------------------------
#[cfg(feature = "runtime")]
pub mod observability;
#[cfg(feature = "runtime")]
pub mod resilience;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{CommonError, CommonResult, ErrorClassification, ErrorSeverity};
#[cfg(feature = "runtime")]
pub use observability::{EventReporter, EventReporterConfig, EventSink, ResilienceEvent};
#[cfg(feature = "runtime")]
pub use resilience::{
    with_retry, with_retry_cancellable, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError,
    CircuitSnapshot, CircuitState, Classify, Clock, ErrorClass, ErrorClassifier, MockClock,
    RegistryLimits, ResilienceError, ResilienceRegistry, RetryError, RetryPolicy, SystemClock,
};
#[cfg(feature = "foundation")]
pub use utils::serde::{duration_millis, option_duration_millis};
