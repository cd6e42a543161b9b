//! Backend guard
//!
//! Owns the resilience registry for the four backend categories, the event
//! reporter and the cleanup task. Request handlers call backends through
//! [`BackendGuard::call`]; health endpoints read [`BackendGuard::health`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use relaygate_common::error::{CommonError, CommonResult};
use relaygate_common::observability::{
    EventReporter, EventReporterStats, EventSink, TracingEventSink,
};
use relaygate_common::resilience::{
    Admission, CircuitOpenError, CircuitSnapshot, CleanupHandle, Clock, ConfigError,
    ResilienceError, ResilienceRegistry, SelfClassifier, SweepReport, SystemClock,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::category::BackendCategory;
use crate::config::ResilienceSettings;
use crate::error::BackendError;

/// Result of a guarded backend call.
pub type GuardResult<T> = Result<T, ResilienceError<BackendError>>;

/// Health payload for monitoring endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `false` when any circuit is open
    pub healthy: bool,
    /// Live circuits by category name. Categories not called recently have
    /// no record and are healthy.
    pub circuits: BTreeMap<String, CircuitSnapshot>,
    pub events: EventReporterStats,
}

impl HealthReport {
    /// Categories whose circuit is open.
    pub fn unhealthy(&self) -> Vec<&str> {
        self.circuits
            .iter()
            .filter(|(_, snapshot)| !snapshot.is_healthy)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// # Errors
    /// Returns `CommonError::Serialization` if encoding fails.
    pub fn to_json(&self) -> CommonResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Resilience front for every backend category.
///
/// Construct inside a tokio runtime; the event worker and the cleanup task
/// are spawned on it. Call [`shutdown`](Self::shutdown) to stop both.
#[derive(Debug)]
pub struct BackendGuard<C: Clock = SystemClock> {
    registry: Arc<ResilienceRegistry<BackendError, C>>,
    events: EventReporter,
    shutdown: CancellationToken,
    cleanup: CleanupHandle,
    event_worker: JoinHandle<()>,
}

impl BackendGuard<SystemClock> {
    /// Guard reporting events to the tracing subscriber.
    ///
    /// # Errors
    /// Returns `CommonError::Config` if `settings` are invalid.
    pub fn new(settings: &ResilienceSettings) -> CommonResult<Self> {
        Self::with_sink(settings, Arc::new(TracingEventSink))
    }

    /// Guard reporting events to `sink`.
    ///
    /// # Errors
    /// Returns `CommonError::Config` if `settings` are invalid.
    pub fn with_sink(settings: &ResilienceSettings, sink: Arc<dyn EventSink>) -> CommonResult<Self> {
        Self::with_clock(settings, sink, Arc::new(SystemClock))
    }
}

impl<C: Clock> BackendGuard<C> {
    /// Guard reading circuit time from `clock`.
    ///
    /// # Errors
    /// Returns `CommonError::Config` if `settings` are invalid.
    pub fn with_clock(
        settings: &ResilienceSettings,
        sink: Arc<dyn EventSink>,
        clock: Arc<C>,
    ) -> CommonResult<Self> {
        settings.validate()?;
        let mut categories = Vec::with_capacity(BackendCategory::ALL.len());
        for category in BackendCategory::ALL {
            categories.push((
                category,
                settings.circuit_config(category)?,
                settings.retry_policy(category)?,
            ));
        }

        let shutdown = CancellationToken::new();
        let (events, event_worker) =
            EventReporter::spawn(sink, settings.event_reporter_config(), shutdown.child_token());

        let registry = ResilienceRegistry::with_clock(Arc::new(SelfClassifier), clock)
            .with_limits(settings.registry_limits())
            .with_events(events.clone());
        for (category, config, policy) in categories {
            let name = category.as_str();
            registry.configure_circuit(name, config).map_err(config_error)?;
            registry.configure_retry(name, policy).map_err(config_error)?;
            registry.configure_classifier(name, category.classifier());
        }

        let registry = Arc::new(registry);
        let cleanup = registry.spawn_cleanup(settings.cleanup_interval(), shutdown.child_token());

        info!(
            max_circuits = settings.max_circuits,
            ttl_secs = settings.circuit_ttl_secs,
            "Backend guard started"
        );
        Ok(Self { registry, events, shutdown, cleanup, event_worker })
    }

    pub fn registry(&self) -> &Arc<ResilienceRegistry<BackendError, C>> {
        &self.registry
    }

    /// Run `operation` against `category` under its circuit and retry policy.
    pub async fn call<F, Fut, T>(&self, category: BackendCategory, operation: F) -> GuardResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.registry.with_resilience(category.as_str(), operation).await
    }

    /// [`call`](Self::call) answering from `fallback` while the circuit is
    /// open.
    pub async fn call_or<F, Fut, T, G, GFut>(
        &self,
        category: BackendCategory,
        operation: F,
        fallback: G,
    ) -> GuardResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
        G: FnOnce(CircuitOpenError) -> GFut,
        GFut: Future<Output = Result<T, BackendError>>,
    {
        self.registry.with_resilience_or(category.as_str(), operation, fallback).await
    }

    /// [`call`](Self::call) that stops when `cancel` fires.
    pub async fn call_cancellable<F, Fut, T>(
        &self,
        category: BackendCategory,
        cancel: &CancellationToken,
        operation: F,
    ) -> GuardResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.registry.with_resilience_cancellable(category.as_str(), cancel, operation).await
    }

    pub fn admit(&self, category: BackendCategory) -> Admission {
        self.registry.admit(category.as_str())
    }

    /// Force `category` back to closed. Returns `false` if it has no record.
    pub fn reset(&self, category: BackendCategory) -> bool {
        self.registry.reset_circuit(category.as_str())
    }

    /// Run one cleanup pass now.
    pub fn sweep(&self) -> SweepReport {
        self.registry.sweep()
    }

    pub fn health(&self) -> HealthReport {
        let circuits = self.registry.all_circuit_states();
        let healthy = circuits.values().all(|snapshot| snapshot.is_healthy);
        HealthReport { healthy, circuits, events: self.events.stats() }
    }

    pub fn event_stats(&self) -> EventReporterStats {
        self.events.stats()
    }

    /// Stop the cleanup task and the event worker, delivering queued events
    /// first.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.cleanup.shutdown().await;
        if let Err(error) = self.event_worker.await {
            warn!(%error, "Event worker ended abnormally");
        }
        info!("Backend guard stopped");
    }
}

fn config_error(error: ConfigError) -> CommonError {
    CommonError::config(error.to_string())
}
