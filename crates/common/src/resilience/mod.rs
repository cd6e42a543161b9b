//! Resilience layer for calls to flaky backends
//!
//! Each backend category (version control, language intelligence, local
//! filesystem, package registry) gets its own circuit breaker, retry policy
//! and error classifier, held by a [`ResilienceRegistry`]:
//!
//! - **Error Classifier** (`classify`): maps a failure to transient,
//!   rate-limited or fatal.
//! - **Retry Executor** (`retry`): exponential backoff with bounded jitter,
//!   honouring rate-limit hints, cancellable between and during attempts.
//! - **Circuit Breaker** (`circuit_breaker`): CLOSED / OPEN / HALF_OPEN with a
//!   single half-open probe.
//! - **Resilience Composer** (`composer`): admission, then retry, then one
//!   breaker outcome per call.
//! - **Registry** (`registry`): lazy circuit creation, TTL and LRU cleanup,
//!   health snapshots.
//!
//! Circuit timing reads a [`Clock`] so state transitions can be tested with
//! [`MockClock`]; backoff sleeps use tokio time.

pub mod circuit_breaker;
pub mod classify;
pub mod clock;
pub mod composer;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    Admission, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitOpenError, CircuitSnapshot, CircuitState, ConfigError, ConfigResult, Transition,
};
pub use classify::{
    classify_http_status, classify_io_kind, AlwaysRetry, Classify, ErrorClass, ErrorClassifier,
    FnClassifier, NeverRetry, SelfClassifier, SharedClassifier,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use composer::ResilienceError;
pub use registry::{CleanupHandle, RegistryLimits, ResilienceRegistry, SweepReport};
pub use retry::{
    with_retry, with_retry_cancellable, JitterRange, RetryError, RetryExecutor,
    RetryExhaustedError, RetryOutcome, RetryPolicy, RetryPolicyBuilder, RetryResult,
};
