//! Registry of named circuits, policies and classifiers
//!
//! Circuits are created lazily on first use of a category name and stay
//! bounded over a long-running process: [`ResilienceRegistry::sweep`] drops
//! records idle for longer than the TTL, then evicts the least recently
//! active records until the registry is back under `max_circuits`. A circuit
//! with a half-open probe in flight is never evicted.
//!
//! Explicit configuration (breaker config, retry policy, classifier) is kept
//! separately from circuit records and survives eviction, so a re-created
//! circuit picks up the configured values again.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::circuit_breaker::{
    Admission, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitSnapshot,
    ConfigResult, Transition,
};
use super::classify::{Classify, SelfClassifier, SharedClassifier};
use super::clock::{Clock, SystemClock};
use super::retry::RetryPolicy;
use crate::observability::events::EventReporter;

/// Bounds on the number and lifetime of circuit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    /// Idle time after which a record is dropped by the sweep
    pub ttl: Duration,
    /// Maximum number of live records
    pub max_circuits: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(24 * 60 * 60), max_circuits: 256 }
    }
}

/// Result of one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records dropped for exceeding the TTL
    pub expired: usize,
    /// Records dropped to honour the cap
    pub evicted: usize,
    /// Records left after the pass
    pub remaining: usize,
}

struct RegistryState<E, C: Clock> {
    circuits: HashMap<String, Arc<CircuitBreaker<C>>>,
    configs: HashMap<String, CircuitBreakerConfig>,
    policies: HashMap<String, RetryPolicy>,
    classifiers: HashMap<String, SharedClassifier<E>>,
}

impl<E, C: Clock> Default for RegistryState<E, C> {
    fn default() -> Self {
        Self {
            circuits: HashMap::new(),
            configs: HashMap::new(),
            policies: HashMap::new(),
            classifiers: HashMap::new(),
        }
    }
}

/// Process-wide resilience state for one error type.
///
/// Constructed once at startup and shared as `Arc<ResilienceRegistry<E>>`.
pub struct ResilienceRegistry<E, C: Clock = SystemClock> {
    state: Mutex<RegistryState<E, C>>,
    clock: Arc<C>,
    limits: RegistryLimits,
    default_config: CircuitBreakerConfig,
    default_policy: RetryPolicy,
    default_classifier: SharedClassifier<E>,
    events: Option<EventReporter>,
}

impl<E, C: Clock> fmt::Debug for ResilienceRegistry<E, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceRegistry")
            .field("circuits", &self.len())
            .field("limits", &self.limits)
            .field("default_config", &self.default_config)
            .field("default_policy", &self.default_policy)
            .finish_non_exhaustive()
    }
}

impl<E: Classify + 'static> Default for ResilienceRegistry<E, SystemClock> {
    fn default() -> Self {
        Self::new(Arc::new(SelfClassifier))
    }
}

impl<E> ResilienceRegistry<E, SystemClock> {
    /// Registry on the system clock with `default_classifier` for categories
    /// that have no classifier of their own.
    pub fn new(default_classifier: SharedClassifier<E>) -> Self {
        Self::with_clock(default_classifier, Arc::new(SystemClock))
    }
}

impl<E, C: Clock> ResilienceRegistry<E, C> {
    /// Registry reading circuit time from `clock`.
    pub fn with_clock(default_classifier: SharedClassifier<E>, clock: Arc<C>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            clock,
            limits: RegistryLimits::default(),
            default_config: CircuitBreakerConfig::default(),
            default_policy: RetryPolicy::default(),
            default_classifier,
            events: None,
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: RegistryLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Defaults applied to categories without explicit configuration.
    pub fn with_defaults(
        mut self,
        config: CircuitBreakerConfig,
        policy: RetryPolicy,
    ) -> ConfigResult<Self> {
        config.validate()?;
        policy.validate()?;
        self.default_config = config;
        self.default_policy = policy;
        Ok(self)
    }

    /// Report transitions, rejections and retries to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventReporter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    pub(crate) fn events(&self) -> Option<&EventReporter> {
        self.events.as_ref()
    }

    /// Number of live circuit records.
    pub fn len(&self) -> usize {
        self.state.lock().circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    //--------------------------------------------------------------------------
    // Configuration
    //--------------------------------------------------------------------------

    /// Upsert the breaker configuration for `name`, before or after first use.
    ///
    /// A live circuit keeps its state and counters; the new thresholds apply
    /// from its next admission or outcome.
    pub fn configure_circuit(&self, name: &str, config: CircuitBreakerConfig) -> ConfigResult<()> {
        config.validate()?;
        let mut state = self.state.lock();
        state.configs.insert(name.to_string(), config);
        if let Some(circuit) = state.circuits.get(name) {
            circuit.reconfigure(config)?;
        }
        debug!(category = name, ?config, "Circuit configured");
        Ok(())
    }

    /// Upsert the retry policy for `name`.
    pub fn configure_retry(&self, name: &str, policy: RetryPolicy) -> ConfigResult<()> {
        policy.validate()?;
        debug!(category = name, max_attempts = policy.max_attempts, "Retry policy configured");
        self.state.lock().policies.insert(name.to_string(), policy);
        Ok(())
    }

    /// Install the error classifier used for `name`.
    pub fn configure_classifier(&self, name: &str, classifier: SharedClassifier<E>) {
        self.state.lock().classifiers.insert(name.to_string(), classifier);
    }

    /// Breaker configuration that applies to `name`.
    pub fn circuit_config(&self, name: &str) -> CircuitBreakerConfig {
        self.state.lock().configs.get(name).copied().unwrap_or(self.default_config)
    }

    /// Retry policy that applies to `name`.
    pub fn retry_policy(&self, name: &str) -> RetryPolicy {
        self.state.lock().policies.get(name).cloned().unwrap_or_else(|| self.default_policy.clone())
    }

    /// Classifier that applies to `name`.
    pub fn classifier(&self, name: &str) -> SharedClassifier<E> {
        self.state
            .lock()
            .classifiers
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_classifier))
    }

    //--------------------------------------------------------------------------
    // Circuit operations
    //--------------------------------------------------------------------------

    /// Circuit for `name`, created with its configured or default config.
    pub fn circuit(&self, name: &str) -> Arc<CircuitBreaker<C>> {
        let mut state = self.state.lock();
        if let Some(existing) = state.circuits.get(name) {
            return Arc::clone(existing);
        }

        if state.circuits.len() >= self.limits.max_circuits {
            let excess = state.circuits.len() + 1 - self.limits.max_circuits;
            let evicted = evict_least_recent(&mut state.circuits, excess);
            if evicted < excess {
                warn!(
                    category = name,
                    max_circuits = self.limits.max_circuits,
                    "Circuit cap exceeded, every candidate has a probe in flight"
                );
            }
        }

        let config = state.configs.get(name).copied().unwrap_or(self.default_config);
        let mut breaker =
            CircuitBreaker::from_validated(name.to_string(), config, Arc::clone(&self.clock));
        if let Some(events) = &self.events {
            breaker = breaker.with_events(events.clone());
        }
        let breaker = Arc::new(breaker);
        state.circuits.insert(name.to_string(), Arc::clone(&breaker));
        debug!(category = name, total = state.circuits.len(), "Circuit created");
        breaker
    }

    /// Admission check for `name`. See [`CircuitBreaker::admit`].
    pub fn admit(&self, name: &str) -> Admission {
        self.circuit(name).admit()
    }

    /// Admission check returning an outcome-reporting permit.
    pub fn try_acquire(&self, name: &str) -> Result<CallPermit<C>, CircuitOpenError> {
        self.circuit(name).try_acquire()
    }

    /// Record a success for `name` directly.
    pub fn record_success(&self, name: &str) -> Option<Transition> {
        self.circuit(name).record_success()
    }

    /// Record a failure for `name` directly.
    pub fn record_failure(&self, name: &str) -> Option<Transition> {
        self.circuit(name).record_failure()
    }

    /// Force `name` closed with zeroed counters. Returns `false` when no
    /// record exists, which is equivalent to closed.
    pub fn reset_circuit(&self, name: &str) -> bool {
        let circuit = self.state.lock().circuits.get(name).cloned();
        match circuit {
            Some(circuit) => {
                circuit.reset();
                true
            }
            None => false,
        }
    }

    /// Drop the record for `name`. Configuration is kept.
    pub fn remove_circuit(&self, name: &str) -> bool {
        let removed = self.state.lock().circuits.remove(name).is_some();
        if removed {
            debug!(category = name, "Circuit removed");
        }
        removed
    }

    /// Snapshot of `name`, without creating it.
    pub fn circuit_state(&self, name: &str) -> Option<CircuitSnapshot> {
        let circuit = self.state.lock().circuits.get(name).cloned();
        circuit.map(|c| c.snapshot())
    }

    /// Snapshots of every live circuit, ordered by name.
    pub fn all_circuit_states(&self) -> BTreeMap<String, CircuitSnapshot> {
        let circuits: Vec<Arc<CircuitBreaker<C>>> =
            self.state.lock().circuits.values().cloned().collect();
        circuits.into_iter().map(|c| (c.name().to_string(), c.snapshot())).collect()
    }

    //--------------------------------------------------------------------------
    // Cleanup
    //--------------------------------------------------------------------------

    /// One TTL sweep followed by LRU eviction down to the cap.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let ttl = self.limits.ttl;
        let mut state = self.state.lock();

        let expired: Vec<String> = state
            .circuits
            .iter()
            .filter(|(_, circuit)| {
                !circuit.has_probe_in_flight()
                    && now.saturating_duration_since(circuit.last_activity()) > ttl
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            state.circuits.remove(name);
        }

        let evicted = match state.circuits.len().checked_sub(self.limits.max_circuits) {
            Some(excess) if excess > 0 => evict_least_recent(&mut state.circuits, excess),
            _ => 0,
        };

        let report = SweepReport { expired: expired.len(), evicted, remaining: state.circuits.len() };
        if report.expired > 0 || report.evicted > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = report.remaining,
                "Circuit cleanup removed records"
            );
        } else {
            debug!(remaining = report.remaining, "Circuit cleanup found nothing to remove");
        }
        report
    }
}

impl<E, C> ResilienceRegistry<E, C>
where
    E: 'static,
    C: Clock,
{
    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` is
    /// cancelled or the registry is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> CleanupHandle {
        let registry: Weak<Self> = Arc::downgrade(self);
        let token = shutdown.clone();
        let period = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        registry.sweep();
                    }
                }
            }
            debug!("Circuit cleanup task stopped");
        });

        info!(interval_secs = period.as_secs(), "Circuit cleanup task started");
        CleanupHandle { shutdown, task }
    }
}

/// Handle to the background cleanup task.
#[derive(Debug)]
pub struct CleanupHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.task.await {
            warn!(%error, "Circuit cleanup task ended abnormally");
        }
    }
}

/// Remove up to `count` records, least recently active first, skipping any
/// with a probe in flight. Returns the number removed.
fn evict_least_recent<C: Clock>(
    circuits: &mut HashMap<String, Arc<CircuitBreaker<C>>>,
    count: usize,
) -> usize {
    let mut candidates: Vec<(std::time::Instant, String)> = circuits
        .iter()
        .filter(|(_, circuit)| !circuit.has_probe_in_flight())
        .map(|(name, circuit)| (circuit.last_activity(), name.clone()))
        .collect();
    candidates.sort();

    let mut evicted = 0;
    for (_, name) in candidates.into_iter().take(count) {
        circuits.remove(&name);
        debug!(category = %name, "Evicted least recently used circuit");
        evicted += 1;
    }
    evicted
}
