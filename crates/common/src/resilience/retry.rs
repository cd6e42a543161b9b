//! Retry executor with exponential backoff and bounded jitter
//!
//! The executor invokes an operation up to `max_attempts` times. Every failure
//! is classified first: fatal errors stop immediately, transient and
//! rate-limited errors are retried after
//!
//! ```text
//! base  = min(max_delay, initial_delay * multiplier^i)
//! delay = min(max_delay, base * U(jitter.min, jitter.max))
//! ```
//!
//! where `i` is the 0-based index of the attempt that just failed. A
//! rate-limit hint from the server raises the delay but never beyond
//! `max_delay`.
//!
//! Each attempt receives a child [`CancellationToken`]. Cancelling the parent
//! during an attempt or a backoff sleep stops the sequence with
//! [`RetryError::Cancelled`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::circuit_breaker::{ConfigError, ConfigResult};
use super::classify::{ErrorClass, ErrorClassifier};
use crate::observability::events::{EventReporter, ResilienceEvent};

//==============================================================================
// Errors
//==============================================================================

/// Every permitted attempt failed with a retryable error.
#[derive(Debug, Error)]
#[error("All {attempts} retry attempts exhausted after {elapsed:?}")]
pub struct RetryExhaustedError<E> {
    /// Number of attempts made
    pub attempts: u32,
    /// Wall time from the first attempt to the last failure
    pub elapsed: Duration,
    /// Error returned by the final attempt
    pub source: E,
}

impl<E> RetryExhaustedError<E> {
    /// Consume the error and return the last underlying failure.
    pub fn into_source(self) -> E {
        self.source
    }
}

/// Errors returned by the retry executor
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All attempts failed with retryable errors
    #[error("{0}")]
    Exhausted(RetryExhaustedError<E>),

    /// The operation failed with an error classified as fatal
    #[error("Operation failed with non-retryable error after {attempts} attempt(s)")]
    Fatal { source: E, attempts: u32 },

    /// The caller cancelled the sequence
    #[error("Retry cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Number of attempts made before the sequence ended.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted(exhausted) => exhausted.attempts,
            Self::Fatal { attempts, .. } | Self::Cancelled { attempts } => *attempts,
        }
    }

    /// Whether the caller cancelled the sequence.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Last underlying error, if the operation produced one.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted(exhausted) => Some(exhausted.source),
            Self::Fatal { source, .. } => Some(source),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// Outcome of a retry execution including result and summary statistics.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: RetryResult<T, E>,
    pub attempts: u32,
    pub total_delay: Duration,
    pub elapsed: Duration,
    /// Classification of the last failed attempt.
    pub last_class: Option<ErrorClass>,
}

impl<T, E> RetryOutcome<T, E> {
    /// Consume the outcome and return only the result.
    pub fn into_result(self) -> RetryResult<T, E> {
        self.result
    }

    /// Average backoff between attempts (excludes operation execution time).
    pub fn average_delay(&self) -> Duration {
        if self.attempts <= 1 {
            return Duration::ZERO;
        }
        self.total_delay / (self.attempts - 1)
    }
}

//==============================================================================
// Policy
//==============================================================================

/// Multiplicative jitter bounds applied to the exponential base delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterRange {
    pub min: f64,
    pub max: f64,
}

impl Default for JitterRange {
    fn default() -> Self {
        Self { min: 0.5, max: 1.5 }
    }
}

impl JitterRange {
    /// Jitter disabled: the factor is always 1.
    pub const fn none() -> Self {
        Self { min: 1.0, max: 1.0 }
    }

    fn validate(&self) -> ConfigResult<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(ConfigError::invalid("jitter bounds must be finite"));
        }
        if self.min < 0.0 {
            return Err(ConfigError::invalid("jitter minimum must not be negative"));
        }
        if self.min > self.max {
            return Err(ConfigError::invalid("jitter minimum must not exceed jitter maximum"));
        }
        Ok(())
    }

    fn sample(&self) -> f64 {
        if self.min >= self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

/// Retry policy for one backend category.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Base delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Exponential growth factor, strictly greater than 1
    pub backoff_multiplier: f64,
    pub jitter: JitterRange,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: JitterRange::default(),
        }
    }
}

impl RetryPolicy {
    /// Start a builder seeded with the defaults.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
            return Err(ConfigError::invalid("backoff_multiplier must be greater than 1"));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid("initial_delay must not exceed max_delay"));
        }
        self.jitter.validate()
    }

    /// Exponential delay before jitter for the retry following attempt
    /// `retry_index` (0-based), capped at `max_delay`.
    pub fn base_delay(&self, retry_index: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.round() as u64).min(self.max_delay)
    }

    /// Delay for a given jitter factor and optional server hint.
    pub fn delay_with_factor(
        &self,
        retry_index: u32,
        factor: f64,
        hint: Option<Duration>,
    ) -> Duration {
        let millis = self.base_delay(retry_index).as_millis() as f64 * factor;
        let delay = Duration::from_millis(millis.round() as u64).min(self.max_delay);
        match hint {
            Some(hint) => delay.max(hint).min(self.max_delay),
            None => delay,
        }
    }

    /// Jittered delay before the retry following attempt `retry_index`.
    pub fn delay_for(&self, retry_index: u32, hint: Option<Duration>) -> Duration {
        self.delay_with_factor(retry_index, self.jitter.sample(), hint)
    }
}

/// Builder for [`RetryPolicy`] with fluent API
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, min: f64, max: f64) -> Self {
        self.policy.jitter = JitterRange { min, max };
        self
    }

    pub fn no_jitter(mut self) -> Self {
        self.policy.jitter = JitterRange::none();
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

//==============================================================================
// Executor
//==============================================================================

const DEFAULT_CATEGORY: &str = "default";

/// Reusable retry executor pairing a policy with a classifier.
pub struct RetryExecutor<K> {
    policy: RetryPolicy,
    classifier: K,
    category: Option<String>,
    events: Option<EventReporter>,
}

impl<K> fmt::Debug for RetryExecutor<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .field("category", &self.category)
            .finish_non_exhaustive()
    }
}

impl<K> RetryExecutor<K> {
    /// Create an executor.
    ///
    /// Policies produced by [`RetryPolicyBuilder::build`] are already
    /// validated; a hand-assembled policy should be checked with
    /// [`RetryPolicy::validate`] first.
    pub fn new(policy: RetryPolicy, classifier: K) -> Self {
        Self { policy, classifier, category: None, events: None }
    }

    /// Label attempts, logs and metrics with a category name.
    #[must_use]
    pub fn with_category<S: Into<String>>(mut self, category: S) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Report scheduled retries and exhaustion to an event reporter.
    #[must_use]
    pub fn with_events(mut self, events: EventReporter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn category(&self) -> &str {
        self.category.as_deref().unwrap_or(DEFAULT_CATEGORY)
    }

    /// Execute an operation with retry logic.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        K: ErrorClassifier<E>,
        E: fmt::Debug,
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(&CancellationToken::new(), operation).await.into_result()
    }

    /// Execute an operation with retry logic, stopping when `cancel` fires.
    pub async fn execute_cancellable<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> RetryResult<T, E>
    where
        K: ErrorClassifier<E>,
        E: fmt::Debug,
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with_outcome(cancel, operation).await.into_result()
    }

    /// Execute an operation with retry logic and return outcome statistics.
    #[instrument(
        skip_all,
        fields(category = %self.category(), max_attempts = self.policy.max_attempts)
    )]
    pub async fn execute_with_outcome<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        K: ErrorClassifier<E>,
        E: fmt::Debug,
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let mut attempts: u32 = 0;
        let mut total_delay = Duration::ZERO;
        let mut last_class = None;

        loop {
            if cancel.is_cancelled() {
                return self.finish(
                    Err(RetryError::Cancelled { attempts }),
                    attempts,
                    total_delay,
                    start,
                    last_class,
                );
            }

            attempts += 1;
            debug!(attempt = attempts, "Executing operation");

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(attempt = attempts, "Operation cancelled mid-attempt");
                    return self.finish(
                        Err(RetryError::Cancelled { attempts }),
                        attempts,
                        total_delay,
                        start,
                        last_class,
                    );
                }
                result = operation(cancel.child_token()) => result,
            };

            let error = match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(attempts, "Operation succeeded after retries");
                    }
                    return self.finish(Ok(value), attempts, total_delay, start, last_class);
                }
                Err(error) => error,
            };

            let class = self.classifier.classify(&error);
            last_class = Some(class);

            if !class.is_retryable() {
                debug!(attempt = attempts, error = ?error, "Error classified as fatal, not retrying");
                return self.finish(
                    Err(RetryError::Fatal { source: error, attempts }),
                    attempts,
                    total_delay,
                    start,
                    last_class,
                );
            }

            if attempts >= self.policy.max_attempts {
                let elapsed = start.elapsed();
                warn!(attempts, elapsed_ms = elapsed.as_millis() as u64, error = ?error, "All retry attempts exhausted");
                if let Some(events) = &self.events {
                    events.emit(ResilienceEvent::RetryExhausted {
                        category: self.category().to_string(),
                        attempts,
                        elapsed,
                    });
                }
                return self.finish(
                    Err(RetryError::Exhausted(RetryExhaustedError { attempts, elapsed, source: error })),
                    attempts,
                    total_delay,
                    start,
                    last_class,
                );
            }

            let delay = self.policy.delay_for(attempts - 1, class.retry_after());
            warn!(
                attempt = attempts,
                class = %class,
                delay_ms = delay.as_millis() as u64,
                error = ?error,
                "Operation failed, retrying after backoff"
            );
            metrics::counter!("relaygate_retry_attempts_total", "category" => self.category().to_string())
                .increment(1);
            if let Some(events) = &self.events {
                events.emit(ResilienceEvent::RetryScheduled {
                    category: self.category().to_string(),
                    attempt: attempts,
                    delay,
                    class,
                });
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(attempt = attempts, "Retry cancelled during backoff");
                    return self.finish(
                        Err(RetryError::Cancelled { attempts }),
                        attempts,
                        total_delay,
                        start,
                        last_class,
                    );
                }
                () = tokio::time::sleep(delay) => {}
            }
            total_delay += delay;
        }
    }

    fn finish<T, E>(
        &self,
        result: RetryResult<T, E>,
        attempts: u32,
        total_delay: Duration,
        start: Instant,
        last_class: Option<ErrorClass>,
    ) -> RetryOutcome<T, E> {
        RetryOutcome { result, attempts, total_delay, elapsed: start.elapsed(), last_class }
    }
}

/// Run `operation` under `policy`, classifying failures with `classifier`.
pub async fn with_retry<F, Fut, T, E, K>(
    policy: RetryPolicy,
    classifier: K,
    operation: F,
) -> RetryResult<T, E>
where
    K: ErrorClassifier<E>,
    E: fmt::Debug,
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_cancellable(policy, classifier, &CancellationToken::new(), operation).await
}

/// [`with_retry`] that stops when `cancel` fires.
pub async fn with_retry_cancellable<F, Fut, T, E, K>(
    policy: RetryPolicy,
    classifier: K,
    cancel: &CancellationToken,
    operation: F,
) -> RetryResult<T, E>
where
    K: ErrorClassifier<E>,
    E: fmt::Debug,
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    RetryExecutor::new(policy, classifier).execute_cancellable(cancel, operation).await
}

#[cfg(test)]
mod tests {
    //! Unit tests for the retry executor
    //!
    //! Tests cover policy validation, the backoff and jitter bounds, rate-limit
    //! hints, fatal and exhausted termination, and cancellation. Executor tests
    //! run on paused tokio time so backoff sleeps complete instantly.

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::resilience::classify::{AlwaysRetry, Classify, SelfClassifier};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Failure {
        Transient(u32),
        Limited(u64),
        Fatal,
    }

    impl Classify for Failure {
        fn classify(&self) -> ErrorClass {
            match self {
                Self::Transient(_) => ErrorClass::Transient,
                Self::Limited(ms) => {
                    ErrorClass::RateLimited { retry_after: Some(Duration::from_millis(*ms)) }
                }
                Self::Fatal => ErrorClass::Fatal,
            }
        }
    }

    fn fixed_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .backoff_multiplier(2.0)
            .no_jitter()
            .build()
            .unwrap()
    }

    /// Validates `RetryPolicy::validate` for the invalid configuration
    /// scenario.
    ///
    /// Assertions:
    /// - Zero attempts, a multiplier of 1, an initial delay above the cap and
    ///   inverted or negative jitter bounds are all rejected.
    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::builder().max_attempts(0).build().is_err());
        assert!(RetryPolicy::builder().backoff_multiplier(1.0).build().is_err());
        assert!(RetryPolicy::builder().backoff_multiplier(f64::NAN).build().is_err());
        assert!(RetryPolicy::builder()
            .initial_delay(Duration::from_secs(5))
            .max_delay(Duration::from_secs(1))
            .build()
            .is_err());
        assert!(RetryPolicy::builder().jitter(1.5, 0.5).build().is_err());
        assert!(RetryPolicy::builder().jitter(-0.1, 1.0).build().is_err());
    }

    #[test]
    fn test_base_delay_grows_and_caps() {
        let policy = fixed_policy(5);
        let delays: Vec<u64> =
            (0..6).map(|i| policy.base_delay(i).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(policy.base_delay(10_000), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_with_factor_bounds() {
        let policy = fixed_policy(5);
        assert_eq!(policy.delay_with_factor(0, 0.5, None), Duration::from_millis(50));
        assert_eq!(policy.delay_with_factor(0, 1.5, None), Duration::from_millis(150));
        assert_eq!(policy.delay_with_factor(3, 1.5, None), Duration::from_secs(1));
    }

    /// Validates that a rate-limit hint raises but never exceeds the cap.
    ///
    /// Assertions:
    /// - A hint above the computed delay wins.
    /// - A hint below the computed delay is ignored.
    /// - A hint above `max_delay` is clamped.
    #[test]
    fn test_rate_limit_hint() {
        let policy = fixed_policy(5);
        let hint = |ms| Some(Duration::from_millis(ms));
        assert_eq!(policy.delay_with_factor(0, 1.0, hint(700)), Duration::from_millis(700));
        assert_eq!(policy.delay_with_factor(2, 1.0, hint(10)), Duration::from_millis(400));
        assert_eq!(policy.delay_with_factor(0, 1.0, hint(5000)), Duration::from_secs(1));
    }

    #[test]
    fn test_jittered_delay_within_bounds() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(2))
            .backoff_multiplier(2.0)
            .jitter(0.5, 1.5)
            .build()
            .unwrap();

        for index in 0..8 {
            let base = policy.base_delay(index);
            let lower = Duration::from_millis((base.as_millis() as f64 * 0.5).round() as u64);
            let upper = Duration::from_millis((base.as_millis() as f64 * 1.5).round() as u64)
                .min(policy.max_delay);
            for _ in 0..200 {
                let delay = policy.delay_for(index, None);
                assert!(delay >= lower, "delay {delay:?} below {lower:?} at index {index}");
                assert!(delay <= upper, "delay {delay:?} above {upper:?} at index {index}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fixed_policy(5), SelfClassifier).with_category("search");

        let outcome = executor
            .execute_with_outcome(&CancellationToken::new(), |_token| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(Failure::Transient(n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.total_delay, Duration::from_millis(300));
        assert_eq!(outcome.average_delay(), Duration::from_millis(150));
        assert!(outcome.elapsed >= Duration::from_millis(300));
        assert_eq!(outcome.last_class, Some(ErrorClass::Transient));
        assert_eq!(outcome.into_result().unwrap(), 3);
    }

    /// Validates that a fatal error stops the sequence after one attempt.
    ///
    /// Assertions:
    /// - The operation is invoked exactly once.
    /// - The original error is returned with `attempts == 1`.
    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fixed_policy(5), SelfClassifier);

        let result: RetryResult<(), Failure> = executor
            .execute(|_token| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Failure::Fatal)
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(RetryError::Fatal { source, attempts }) => {
                assert_eq!(source, Failure::Fatal);
                assert_eq!(attempts, 1);
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_carries_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fixed_policy(3), SelfClassifier);

        let result: RetryResult<(), Failure> = executor
            .execute(|_token| {
                let calls = Arc::clone(&calls);
                async move { Err(Failure::Transient(calls.fetch_add(1, Ordering::SeqCst) + 1)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RetryError::Exhausted(exhausted)) => {
                assert_eq!(exhausted.attempts, 3);
                assert!(exhausted.elapsed >= Duration::from_millis(300));
                assert_eq!(exhausted.into_source(), Failure::Transient(3));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_hint_delays_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(5))
            .no_jitter()
            .build()
            .unwrap();

        let outcome = RetryExecutor::new(policy, SelfClassifier)
            .execute_with_outcome(&CancellationToken::new(), |_token| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Failure::Limited(2000))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.total_delay, Duration::from_secs(2));
        assert_eq!(outcome.into_result().unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_during_backoff() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(60))
            .no_jitter()
            .build()
            .unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result: RetryResult<(), Failure> =
            with_retry_cancellable(policy, SelfClassifier, &cancel, |_token| {
                let calls = Arc::clone(&calls);
                async move { Err(Failure::Transient(calls.fetch_add(1, Ordering::SeqCst))) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Validates cancellation of an attempt that never completes.
    ///
    /// Assertions:
    /// - The attempt's child token observes the cancellation.
    /// - The executor returns `Cancelled` without waiting for the attempt.
    #[tokio::test(start_paused = true)]
    async fn test_cancelled_mid_attempt() {
        let cancel = CancellationToken::new();
        let observed = Arc::new(AtomicU32::new(0));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let watcher = Arc::clone(&observed);
        let result: RetryResult<(), Failure> =
            with_retry_cancellable(fixed_policy(3), SelfClassifier, &cancel, move |token| {
                let watcher = Arc::clone(&watcher);
                tokio::spawn(async move {
                    token.cancelled().await;
                    watcher.fetch_add(1, Ordering::SeqCst);
                });
                std::future::pending()
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
        for _ in 0..10 {
            if observed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_invokes() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let result: RetryResult<(), &str> =
            with_retry_cancellable(fixed_policy(3), AlwaysRetry, &cancel, |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("unreachable") }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_free_function() {
        let calls = AtomicU32::new(0);
        let result = with_retry(fixed_policy(2), AlwaysRetry, |_token| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("flaky")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_error_accessors() {
        let exhausted: RetryError<&str> = RetryError::Exhausted(RetryExhaustedError {
            attempts: 4,
            elapsed: Duration::from_secs(1),
            source: "boom",
        });
        assert_eq!(exhausted.attempts(), 4);
        assert!(exhausted.to_string().contains("4 retry attempts"));
        assert_eq!(exhausted.into_source(), Some("boom"));

        let cancelled: RetryError<&str> = RetryError::Cancelled { attempts: 2 };
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.into_source(), None);
    }
}
