//! Per-category circuit breaker state machine
//!
//! # States
//! - Closed: calls pass through, consecutive failures are counted
//! - Open: calls are rejected without touching the backend
//! - Half-Open: a single probe call tests whether the backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open:       failure_count reaches failure_threshold
//! Open → Half-Open:    reset_timeout elapsed and an admission request arrives
//! Half-Open → Closed:  success_threshold consecutive probes succeed
//! Half-Open → Open:    any probe fails
//! ```
//!
//! Admission and state mutation for one circuit happen inside a single
//! critical section with no suspension point, so two interleaved callers can
//! never both become "the" half-open probe.
//!
//! A probe claimed through [`CircuitBreaker::admit`] carries no permit, so it
//! holds the slot only for a lease of `reset_timeout` (at least
//! [`MIN_PROBE_LEASE`]). Once the lease lapses without a recorded outcome the
//! next admission takes the slot over. Probes claimed through
//! [`CircuitBreaker::try_acquire`] are released by their permit instead.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use crate::error::CommonError;
use crate::observability::events::{EventReporter, ResilienceEvent};

//==============================================================================
// Configuration
//==============================================================================

/// Shortest time a permit-less probe holds the half-open slot.
pub const MIN_PROBE_LEASE: Duration = Duration::from_secs(1);

/// Invalid breaker or retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Thresholds and timing for one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,
    /// Consecutive probe successes that close a half-open circuit
    pub success_threshold: u32,
    /// Time an open circuit waits before admitting a probe
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, success_threshold: 2, reset_timeout: Duration::from_secs(60) }
    }
}

impl CircuitBreakerConfig {
    /// Start a builder seeded with the defaults.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// How long a probe admitted without a permit holds the half-open slot.
    pub fn probe_lease(&self) -> Duration {
        self.reset_timeout.max(MIN_PROBE_LEASE)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

//==============================================================================
// Public state types
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected fast
    Open,
    /// One probe at a time tests recovery
    HalfOpen,
}

impl CircuitState {
    /// Stable label used in logs and metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection returned when a circuit refuses admission.
///
/// The wrapped operation was never invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpenError {
    /// Category whose circuit rejected the call
    pub category: String,
    /// Time until the circuit will admit a probe, when known
    pub retry_after: Option<Duration>,
}

impl fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_after {
            Some(retry) => write!(
                f,
                "Circuit breaker open for '{}' (retry in {}s)",
                self.category,
                retry.as_secs_f64().ceil()
            ),
            None => write!(f, "Circuit breaker open for '{}'", self.category),
        }
    }
}

impl std::error::Error for CircuitOpenError {}

impl From<CircuitOpenError> for CommonError {
    fn from(err: CircuitOpenError) -> Self {
        CommonError::circuit_breaker(err.category, err.retry_after)
    }
}

impl CircuitOpenError {
    /// Whole seconds until retry, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
    }
}

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub state: CircuitState,
    pub retry_after: Option<Duration>,
}

/// A state change observed while recording an outcome or admitting a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time view of a circuit, as exposed to health endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub is_healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub probe_in_flight: bool,
    pub idle_ms: u64,
}

//==============================================================================
// State machine
//==============================================================================

#[derive(Debug)]
struct CircuitCore {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    probe_in_flight: bool,
    probe_lease_until: Option<Instant>,
    epoch: u64,
    created_at: Instant,
    last_failure_at: Option<Instant>,
    last_state_change_at: Instant,
    last_used_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    epoch: u64,
    probe: bool,
}

impl CircuitCore {
    fn new(config: CircuitBreakerConfig, now: Instant) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            probe_in_flight: false,
            probe_lease_until: None,
            epoch: 0,
            created_at: now,
            last_failure_at: None,
            last_state_change_at: now,
            last_used_at: now,
        }
    }

    fn enter(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_state_change_at = now;
        self.epoch = self.epoch.wrapping_add(1);
        self.probe_in_flight = false;
        self.probe_lease_until = None;
        match to {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::HalfOpen => self.success_count = 0,
            CircuitState::Open => {}
        }
        Transition { from, to }
    }

    fn open_remaining(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_state_change_at);
        self.config.reset_timeout.saturating_sub(elapsed)
    }

    /// Probe slot taken, and not by a lapsed lease.
    fn probe_active(&self, now: Instant) -> bool {
        self.state == CircuitState::HalfOpen
            && self.probe_in_flight
            && self.probe_lease_until.map_or(true, |until| now < until)
    }

    fn admit(&mut self, now: Instant) -> (Admission, Option<Ticket>, Option<Transition>) {
        self.last_used_at = now;
        match self.state {
            CircuitState::Closed => (
                Admission { allowed: true, state: CircuitState::Closed, retry_after: None },
                Some(Ticket { epoch: self.epoch, probe: false }),
                None,
            ),
            CircuitState::Open => {
                let remaining = self.open_remaining(now);
                if remaining.is_zero() {
                    let transition = self.enter(CircuitState::HalfOpen, now);
                    self.probe_in_flight = true;
                    (
                        Admission { allowed: true, state: CircuitState::HalfOpen, retry_after: None },
                        Some(Ticket { epoch: self.epoch, probe: true }),
                        Some(transition),
                    )
                } else {
                    (
                        Admission {
                            allowed: false,
                            state: CircuitState::Open,
                            retry_after: Some(remaining),
                        },
                        None,
                        None,
                    )
                }
            }
            CircuitState::HalfOpen if self.probe_active(now) => (
                Admission { allowed: false, state: CircuitState::HalfOpen, retry_after: None },
                None,
                None,
            ),
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    debug!(lease_expired = true, "Taking over half-open probe slot");
                }
                self.probe_in_flight = true;
                self.probe_lease_until = None;
                (
                    Admission { allowed: true, state: CircuitState::HalfOpen, retry_after: None },
                    Some(Ticket { epoch: self.epoch, probe: true }),
                    None,
                )
            }
        }
    }

    fn on_success(&mut self, now: Instant) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.probe_lease_until = None;
                self.success_count = self.success_count.saturating_add(1);
                if self.success_count >= self.config.success_threshold {
                    Some(self.enter(CircuitState::Closed, now))
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        }
    }

    fn on_failure(&mut self, now: Instant) -> Option<Transition> {
        let threshold = self.config.failure_threshold;
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= threshold {
                    self.failure_count = threshold;
                    Some(self.enter(CircuitState::Open, now))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count = threshold;
                Some(self.enter(CircuitState::Open, now))
            }
            CircuitState::Open => None,
        }
    }
}

//==============================================================================
// Circuit breaker
//==============================================================================

/// Circuit breaker guarding one backend category.
///
/// Shared as `Arc<CircuitBreaker>`; all mutation goes through one mutex that
/// is never held across an `.await`.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    core: Mutex<CircuitCore>,
    clock: Arc<C>,
    events: Option<EventReporter>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &core.config)
            .field("state", &core.state)
            .field("failure_count", &core.failure_count)
            .field("success_count", &core.success_count)
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker on the system clock.
    pub fn new<S: Into<String>>(name: S, config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker reading time from `clock`.
    pub fn with_clock<S: Into<String>>(
        name: S,
        config: CircuitBreakerConfig,
        clock: Arc<C>,
    ) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(name.into(), config, clock))
    }

    pub(crate) fn from_validated(name: String, config: CircuitBreakerConfig, clock: Arc<C>) -> Self {
        let now = clock.now();
        Self { name, core: Mutex::new(CircuitCore::new(config, now)), clock, events: None }
    }

    /// Attach an event reporter for transition and rejection events.
    #[must_use]
    pub fn with_events(mut self, events: EventReporter) -> Self {
        self.events = Some(events);
        self
    }

    /// Category name of this circuit.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration.
    pub fn config(&self) -> CircuitBreakerConfig {
        self.core.lock().config
    }

    /// Replace the configuration. State and counters are kept; the new
    /// thresholds apply from the next admission or outcome.
    pub fn reconfigure(&self, config: CircuitBreakerConfig) -> ConfigResult<()> {
        config.validate()?;
        self.core.lock().config = config;
        debug!(category = %self.name, ?config, "Circuit breaker reconfigured");
        Ok(())
    }

    /// Current state. Never triggers a transition.
    pub fn state(&self) -> CircuitState {
        self.core.lock().state
    }

    /// Admission check.
    ///
    /// A closed circuit always admits with no effect on state or counters.
    /// An open circuit whose reset timeout has elapsed moves to half-open and
    /// admits the caller as its single probe; the caller must then report
    /// the outcome with [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure) within
    /// [`CircuitBreakerConfig::probe_lease`], after which the slot goes to the
    /// next caller. Prefer [`try_acquire`](Self::try_acquire), which reports
    /// through an RAII permit.
    pub fn admit(&self) -> Admission {
        let now = self.clock.now();
        let (admission, transition) = {
            let mut core = self.core.lock();
            let (admission, ticket, transition) = core.admit(now);
            if ticket.is_some_and(|ticket| ticket.probe) {
                core.probe_lease_until = Some(now + core.config.probe_lease());
            }
            (admission, transition)
        };
        self.after_admission(&admission, transition);
        admission
    }

    /// Admission check returning a permit that reports the call outcome.
    ///
    /// Dropping the permit without reporting (caller cancellation, dropped
    /// future) releases a half-open probe slot without counting a success or
    /// a failure.
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit<C>, CircuitOpenError> {
        let now = self.clock.now();
        let (admission, ticket, transition) = {
            let mut core = self.core.lock();
            core.admit(now)
        };
        self.after_admission(&admission, transition);

        match ticket {
            Some(ticket) => Ok(CallPermit {
                breaker: Arc::clone(self),
                ticket,
                state: admission.state,
                settled: false,
            }),
            None => Err(CircuitOpenError {
                category: self.name.clone(),
                retry_after: admission.retry_after,
            }),
        }
    }

    /// Record a success against the current window.
    pub fn record_success(&self) -> Option<Transition> {
        let now = self.clock.now();
        let transition = {
            let mut core = self.core.lock();
            core.last_used_at = now;
            core.on_success(now)
        };
        self.after_outcome(transition);
        transition
    }

    /// Record a failure against the current window.
    pub fn record_failure(&self) -> Option<Transition> {
        let now = self.clock.now();
        let transition = {
            let mut core = self.core.lock();
            core.last_used_at = now;
            core.on_failure(now)
        };
        self.after_outcome(transition);
        transition
    }

    /// Force the circuit closed with zeroed counters.
    pub fn reset(&self) {
        let now = self.clock.now();
        let transition = {
            let mut core = self.core.lock();
            let transition = core.enter(CircuitState::Closed, now);
            core.last_failure_at = None;
            transition
        };
        if transition.from != CircuitState::Closed {
            info!(category = %self.name, from = %transition.from, "Circuit breaker manually reset to closed state");
            self.emit_transition(transition, 0);
        } else {
            debug!(category = %self.name, "Circuit breaker reset while already closed");
        }
    }

    /// Snapshot for monitoring.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = self.clock.now();
        let core = self.core.lock();
        let retry_after_ms = (core.state == CircuitState::Open)
            .then(|| duration_millis(core.open_remaining(now)));
        CircuitSnapshot {
            name: self.name.clone(),
            state: core.state,
            failures: core.failure_count,
            successes: core.success_count,
            is_healthy: core.state != CircuitState::Open,
            retry_after_ms,
            probe_in_flight: core.probe_active(now),
            idle_ms: duration_millis(
                now.saturating_duration_since(core.last_used_at.max(core.last_state_change_at)),
            ),
        }
    }

    /// Instant of the most recent state change or admission.
    pub fn last_activity(&self) -> Instant {
        let core = self.core.lock();
        core.last_used_at.max(core.last_state_change_at)
    }

    /// Instant the circuit was created.
    pub fn created_at(&self) -> Instant {
        self.core.lock().created_at
    }

    /// Instant of the most recent recorded failure.
    pub fn last_failure_at(&self) -> Option<Instant> {
        self.core.lock().last_failure_at
    }

    /// Whether a half-open probe is currently running.
    pub fn has_probe_in_flight(&self) -> bool {
        let now = self.clock.now();
        self.core.lock().probe_active(now)
    }

    fn settle(&self, ticket: Ticket, success: bool) -> Option<Transition> {
        let now = self.clock.now();
        let transition = {
            let mut core = self.core.lock();
            if core.epoch != ticket.epoch {
                debug!(category = %self.name, success, "Ignoring outcome from a previous circuit window");
                return None;
            }
            core.last_used_at = now;
            if success {
                core.on_success(now)
            } else {
                core.on_failure(now)
            }
        };
        self.after_outcome(transition);
        transition
    }

    fn release(&self, ticket: Ticket) {
        if !ticket.probe {
            return;
        }
        let mut core = self.core.lock();
        if core.epoch == ticket.epoch && core.state == CircuitState::HalfOpen {
            core.probe_in_flight = false;
            core.probe_lease_until = None;
            debug!(category = %self.name, "Half-open probe released without an outcome");
        }
    }

    fn after_admission(&self, admission: &Admission, transition: Option<Transition>) {
        if let Some(transition) = transition {
            info!(category = %self.name, "Circuit breaker half-open, admitting probe");
            self.emit_transition(transition, self.config().failure_threshold);
        }
        if !admission.allowed {
            debug!(category = %self.name, state = %admission.state, "Circuit breaker rejecting call");
            metrics::counter!("relaygate_circuit_rejections_total", "category" => self.name.clone())
                .increment(1);
            if let Some(events) = &self.events {
                events.emit(ResilienceEvent::CallRejected {
                    category: self.name.clone(),
                    state: admission.state,
                    retry_after: admission.retry_after,
                });
            }
        }
    }

    fn after_outcome(&self, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        let failures = match transition.to {
            CircuitState::Open => {
                let threshold = self.config().failure_threshold;
                warn!(category = %self.name, from = %transition.from, failures = threshold, "Circuit breaker opened");
                threshold
            }
            _ => {
                info!(category = %self.name, from = %transition.from, to = %transition.to, "Circuit breaker closed");
                0
            }
        };
        self.emit_transition(transition, failures);
    }

    fn emit_transition(&self, transition: Transition, failures: u32) {
        metrics::counter!(
            "relaygate_circuit_transitions_total",
            "category" => self.name.clone(),
            "to" => transition.to.as_str()
        )
        .increment(1);
        if let Some(events) = &self.events {
            events.emit(ResilienceEvent::CircuitTransition {
                category: self.name.clone(),
                from: transition.from,
                to: transition.to,
                failures,
                timestamp_ms: self.clock.millis_since_epoch(),
            });
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

//==============================================================================
// Call permit
//==============================================================================

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Report exactly one outcome with [`success`](Self::success) or
/// [`failure`](Self::failure). Outcomes from a permit issued in an earlier
/// circuit window (for example a call admitted while closed that finishes
/// after the circuit opened) are ignored.
#[must_use = "a permit must report its outcome or be dropped to release the probe slot"]
pub struct CallPermit<C: Clock = SystemClock> {
    breaker: Arc<CircuitBreaker<C>>,
    ticket: Ticket,
    state: CircuitState,
    settled: bool,
}

impl<C: Clock> fmt::Debug for CallPermit<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("category", &self.breaker.name)
            .field("state", &self.state)
            .field("probe", &self.ticket.probe)
            .finish()
    }
}

impl<C: Clock> CallPermit<C> {
    /// State the circuit was in when this call was admitted.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether this call is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.ticket.probe
    }

    /// Report a successful call.
    pub fn success(mut self) -> Option<Transition> {
        self.settled = true;
        self.breaker.settle(self.ticket, true)
    }

    /// Report a failed call.
    pub fn failure(mut self) -> Option<Transition> {
        self.settled = true;
        self.breaker.settle(self.ticket, false)
    }
}

impl<C: Clock> Drop for CallPermit<C> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.ticket);
        }
    }
}
