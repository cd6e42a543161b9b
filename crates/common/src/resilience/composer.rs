//! Circuit breaker plus retry composition
//!
//! A call through [`ResilienceRegistry::with_resilience`] is admitted by the
//! category's circuit, then run through the retry executor with the
//! category's policy and classifier. The whole retry sequence counts as a
//! single outcome for the breaker: retries absorb transient noise, so only a
//! sequence that ends in exhaustion or a fatal error is a failure. A
//! cancelled call reports nothing and releases its probe slot.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::circuit_breaker::CircuitOpenError;
use super::clock::Clock;
use super::registry::ResilienceRegistry;
use super::retry::{RetryError, RetryExecutor, RetryExhaustedError};
use crate::error::{ErrorClassification, ErrorSeverity};

/// Errors returned by a resilient call.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The circuit rejected the call; the operation was never invoked
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Every permitted attempt failed with a retryable error
    #[error("{0}")]
    RetryExhausted(RetryExhaustedError<E>),

    /// The operation failed with an error classified as fatal
    #[error("{0}")]
    Operation(E),

    /// The circuit was open and the fallback failed too
    #[error("Fallback failed: {0}")]
    Fallback(E),

    /// The caller cancelled the call
    #[error("Operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> From<RetryError<E>> for ResilienceError<E> {
    fn from(err: RetryError<E>) -> Self {
        match err {
            RetryError::Exhausted(exhausted) => Self::RetryExhausted(exhausted),
            RetryError::Fatal { source, .. } => Self::Operation(source),
            RetryError::Cancelled { attempts } => Self::Cancelled { attempts },
        }
    }
}

impl<E> ResilienceError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }

    /// Underlying operation error, if one was produced. A fallback error
    /// is included.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::RetryExhausted(exhausted) => Some(exhausted.source),
            Self::Operation(source) | Self::Fallback(source) => Some(source),
            Self::CircuitOpen(_) | Self::Cancelled { .. } => None,
        }
    }
}

impl<E: ErrorClassification> ErrorClassification for ResilienceError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::CircuitOpen(_) | Self::RetryExhausted(_) => true,
            Self::Operation(source) | Self::Fallback(source) => source.is_retryable(),
            Self::Cancelled { .. } => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CircuitOpen(_) => ErrorSeverity::Warning,
            Self::RetryExhausted(_) => ErrorSeverity::Error,
            Self::Operation(source) | Self::Fallback(source) => source.severity(),
            Self::Cancelled { .. } => ErrorSeverity::Info,
        }
    }

    fn is_critical(&self) -> bool {
        match self {
            Self::Operation(source) | Self::Fallback(source) => source.is_critical(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen(open) => open.retry_after,
            Self::RetryExhausted(exhausted) => exhausted.source.retry_after(),
            Self::Operation(source) | Self::Fallback(source) => source.retry_after(),
            Self::Cancelled { .. } => None,
        }
    }
}

impl<E, C> ResilienceRegistry<E, C>
where
    E: fmt::Debug,
    C: Clock,
{
    /// Run `operation` for category `name` under its circuit and retry policy.
    pub async fn with_resilience<F, Fut, T>(
        &self,
        name: &str,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.with_resilience_cancellable(name, &CancellationToken::new(), operation).await
    }

    /// [`with_resilience`](Self::with_resilience) with a fallback used only
    /// when the circuit rejects the call.
    ///
    /// An error from the fallback comes back as [`ResilienceError::Fallback`].
    pub async fn with_resilience_or<F, Fut, T, G, GFut>(
        &self,
        name: &str,
        operation: F,
        fallback: G,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(CircuitOpenError) -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        match self.with_resilience(name, operation).await {
            Err(ResilienceError::CircuitOpen(open)) => {
                debug!(category = name, "Circuit open, using fallback");
                fallback(open).await.map_err(ResilienceError::Fallback)
            }
            other => other,
        }
    }

    /// [`with_resilience`](Self::with_resilience) that stops when `cancel`
    /// fires. Cancellation is never recorded as a breaker failure.
    #[instrument(skip_all, fields(category = name))]
    pub async fn with_resilience_cancellable<F, Fut, T>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire(name)?;

        let mut executor =
            RetryExecutor::new(self.retry_policy(name), self.classifier(name)).with_category(name);
        if let Some(events) = self.events() {
            executor = executor.with_events(events.clone());
        }

        match executor.execute_cancellable(cancel, operation).await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(RetryError::Cancelled { attempts }) => {
                drop(permit);
                debug!(attempts, "Call cancelled, breaker not updated");
                Err(ResilienceError::Cancelled { attempts })
            }
            Err(error) => {
                permit.failure();
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::CommonError;
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::resilience::classify::SelfClassifier;
    use crate::resilience::clock::MockClock;
    use crate::resilience::retry::RetryPolicy;

    fn registry() -> (ResilienceRegistry<CommonError, MockClock>, MockClock) {
        let clock = MockClock::new();
        let registry =
            ResilienceRegistry::with_clock(Arc::new(SelfClassifier), Arc::new(clock.clone()));
        registry
            .configure_circuit(
                "search",
                CircuitBreakerConfig::builder()
                    .failure_threshold(2)
                    .success_threshold(1)
                    .reset_timeout(Duration::from_secs(5))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .configure_retry(
                "search",
                RetryPolicy::builder()
                    .max_attempts(3)
                    .initial_delay(Duration::from_millis(10))
                    .max_delay(Duration::from_millis(100))
                    .no_jitter()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        (registry, clock)
    }

    fn transient() -> CommonError {
        CommonError::timeout("search", Duration::from_secs(1))
    }

    /// Validates that a retry sequence counts as one breaker outcome.
    ///
    /// Assertions:
    /// - Three transient failures inside one call record one failure.
    /// - A transient failure followed by success records a success.
    #[tokio::test(start_paused = true)]
    async fn test_retry_sequence_is_single_outcome() {
        let (registry, _clock) = registry();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = registry
            .with_resilience("search", |_token| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::RetryExhausted(ref e)) if e.attempts == 3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snapshot = registry.circuit_state("search").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failures, 1);

        let flaky = AtomicU32::new(0);
        let value = registry
            .with_resilience("search", |_token| {
                let n = flaky.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(transient())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(registry.circuit_state("search").unwrap().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_passes_through() {
        let (registry, _clock) = registry();
        let result: Result<(), _> = registry
            .with_resilience("search", |_token| async {
                Err(CommonError::validation("query", "empty"))
            })
            .await;

        match result {
            Err(ResilienceError::Operation(CommonError::Validation { field, .. })) => {
                assert_eq!(field, "query");
            }
            other => panic!("expected operation error, got {other:?}"),
        }
        assert_eq!(registry.circuit_state("search").unwrap().failures, 1);
    }

    /// Validates fail-fast rejection and the fallback path.
    ///
    /// Assertions:
    /// - An open circuit never invokes the operation.
    /// - The fallback receives the rejection and supplies the value.
    /// - Without a fallback the caller gets `CircuitOpen` with a retry hint.
    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_uses_fallback() {
        let (registry, _clock) = registry();
        registry.record_failure("search");
        registry.record_failure("search");

        let calls = AtomicU32::new(0);
        let value = registry
            .with_resilience_or(
                "search",
                |_token| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, CommonError>("live") }
                },
                |open| async move {
                    assert_eq!(open.category, "search");
                    Ok("cached")
                },
            )
            .await
            .unwrap();
        assert_eq!(value, "cached");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let err = registry
            .with_resilience("search", |_token| async { Ok::<_, CommonError>(()) })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_not_used_for_operation_errors() {
        let (registry, _clock) = registry();
        let result = registry
            .with_resilience_or(
                "search",
                |_token| async { Err::<&str, _>(CommonError::validation("query", "empty")) },
                |_open| async { Ok("cached") },
            )
            .await;
        assert!(matches!(result, Err(ResilienceError::Operation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_fallback_is_distinguished() {
        let (registry, _clock) = registry();
        registry.record_failure("search");
        registry.record_failure("search");

        let err = registry
            .with_resilience_or(
                "search",
                |_token| async { Ok::<&str, CommonError>("live") },
                |_open| async { Err(CommonError::validation("cache", "miss")) },
            )
            .await
            .unwrap_err();
        assert!(err.is_fallback());
        assert!(!err.is_circuit_open());
        assert!(err.to_string().starts_with("Fallback failed"));
        assert!(matches!(err.into_operation_error(), Some(CommonError::Validation { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_not_counted() {
        let (registry, clock) = registry();
        registry.record_failure("search");
        registry.record_failure("search");
        clock.advance(Duration::from_secs(5));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = registry
            .with_resilience_cancellable("search", &cancel, |_token| async { Ok(()) })
            .await;

        assert!(matches!(result, Err(ResilienceError::Cancelled { attempts: 0 })));
        let snapshot = registry.circuit_state("search").unwrap();
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert!(!snapshot.probe_in_flight, "Cancelled probe must release its slot");

        let value = registry
            .with_resilience("search", |_token| async { Ok::<_, CommonError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(registry.circuit_state("search").unwrap().state, CircuitState::Closed);
    }

    #[test]
    fn test_error_conversion_and_classification() {
        let fatal: ResilienceError<CommonError> =
            RetryError::Fatal { source: CommonError::internal("broken"), attempts: 1 }.into();
        assert!(fatal.is_critical());
        assert!(!fatal.is_retryable());

        let cancelled: ResilienceError<CommonError> = RetryError::Cancelled { attempts: 2 }.into();
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.severity(), ErrorSeverity::Info);
        assert!(cancelled.into_operation_error().is_none());
    }
}
