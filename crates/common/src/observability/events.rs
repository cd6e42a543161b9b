//! Fire-and-forget resilience event reporting
//!
//! Circuit transitions, rejections and retry decisions are pushed onto a
//! bounded queue and delivered to an [`EventSink`] by a background worker.
//! Emitting never blocks and never fails the caller: a full queue drops the
//! event and counts it, and every sink delivery is bounded by a timeout.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::resilience::{CircuitState, ErrorClass};

/// Event emitted by the resilience layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// A circuit changed state
    CircuitTransition {
        category: String,
        from: CircuitState,
        to: CircuitState,
        failures: u32,
        timestamp_ms: u64,
    },
    /// A call was rejected without invoking the backend
    CallRejected { category: String, state: CircuitState, retry_after: Option<Duration> },
    /// A failed attempt will be retried after `delay`
    RetryScheduled { category: String, attempt: u32, delay: Duration, class: ErrorClass },
    /// Every permitted attempt failed
    RetryExhausted { category: String, attempts: u32, elapsed: Duration },
}

impl ResilienceEvent {
    /// Category the event belongs to.
    pub fn category(&self) -> &str {
        match self {
            Self::CircuitTransition { category, .. }
            | Self::CallRejected { category, .. }
            | Self::RetryScheduled { category, .. }
            | Self::RetryExhausted { category, .. } => category,
        }
    }

    /// Stable event name.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::CircuitTransition { .. } => "circuit_transition",
            Self::CallRejected { .. } => "call_rejected",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::RetryExhausted { .. } => "retry_exhausted",
        }
    }
}

/// Sink delivery failure.
#[derive(Debug, Error)]
pub enum EventSinkError {
    #[error("Event sink unavailable: {0}")]
    Unavailable(String),

    #[error("Event delivery failed: {0}")]
    Delivery(String),
}

/// Destination for resilience events (log pipeline, alerting, telemetry).
#[async_trait]
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Deliver one event.
    async fn record(&self, event: &ResilienceEvent) -> Result<(), EventSinkError>;
}

/// Sink that writes events to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn record(&self, event: &ResilienceEvent) -> Result<(), EventSinkError> {
        match event {
            ResilienceEvent::CircuitTransition { category, from, to, failures, .. } => {
                info!(category = %category, from = %from, to = %to, failures, "circuit transition");
            }
            ResilienceEvent::CallRejected { category, state, retry_after } => {
                debug!(
                    category = %category,
                    state = %state,
                    retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                    "call rejected"
                );
            }
            ResilienceEvent::RetryScheduled { category, attempt, delay, class } => {
                debug!(
                    category = %category,
                    attempt,
                    class = %class,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
            }
            ResilienceEvent::RetryExhausted { category, attempts, elapsed } => {
                warn!(
                    category = %category,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "retries exhausted"
                );
            }
        }
        Ok(())
    }
}

/// Queue and delivery settings for [`EventReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventReporterConfig {
    /// Maximum queued events before new ones are dropped
    pub capacity: usize,
    /// Upper bound on a single sink delivery
    pub delivery_timeout: Duration,
}

impl Default for EventReporterConfig {
    fn default() -> Self {
        Self { capacity: 1024, delivery_timeout: Duration::from_secs(1) }
    }
}

#[derive(Debug, Default)]
struct ReporterCounters {
    queued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Point-in-time reporter statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EventReporterStats {
    pub queued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
    pub timed_out: u64,
}

/// Cheap, cloneable handle for emitting events.
#[derive(Debug, Clone)]
pub struct EventReporter {
    sender: mpsc::Sender<ResilienceEvent>,
    counters: Arc<ReporterCounters>,
}

impl EventReporter {
    /// Start the delivery worker on the current tokio runtime.
    ///
    /// The worker stops when `shutdown` is cancelled, after delivering what
    /// is already queued, or when every reporter handle has been dropped.
    pub fn spawn(
        sink: Arc<dyn EventSink>,
        config: EventReporterConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let counters = Arc::new(ReporterCounters::default());
        let worker = tokio::spawn(run_worker(
            receiver,
            sink,
            config.delivery_timeout,
            Arc::clone(&counters),
            shutdown,
        ));
        (Self { sender, counters }, worker)
    }

    /// Queue an event without waiting. Drops and counts it when the queue is
    /// full or the worker has stopped.
    pub fn emit(&self, event: ResilienceEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(event)) => {
                self.record_drop(&event, "queue full");
            }
            Err(TrySendError::Closed(event)) => {
                self.record_drop(&event, "reporter stopped");
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> EventReporterStats {
        EventReporterStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    fn record_drop(&self, event: &ResilienceEvent, reason: &'static str) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relaygate_events_dropped_total").increment(1);
        debug!(kind = event.kind(), category = event.category(), reason, "Dropped resilience event");
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<ResilienceEvent>,
    sink: Arc<dyn EventSink>,
    delivery_timeout: Duration,
    counters: Arc<ReporterCounters>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = receiver.recv() => match event {
                Some(event) => deliver(sink.as_ref(), &event, delivery_timeout, &counters).await,
                None => break,
            },
        }
    }

    receiver.close();
    while let Ok(event) = receiver.try_recv() {
        deliver(sink.as_ref(), &event, delivery_timeout, &counters).await;
    }
    debug!("Event reporter stopped");
}

async fn deliver(
    sink: &dyn EventSink,
    event: &ResilienceEvent,
    delivery_timeout: Duration,
    counters: &ReporterCounters,
) {
    match tokio::time::timeout(delivery_timeout, sink.record(event)).await {
        Ok(Ok(())) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(error)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(kind = event.kind(), category = event.category(), %error, "Event sink failed");
        }
        Err(_) => {
            counters.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(
                kind = event.kind(),
                category = event.category(),
                timeout_ms = delivery_timeout.as_millis() as u64,
                "Event sink timed out"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::observability::capture::CapturedLogs;

    #[derive(Debug, Default)]
    struct CollectingSink {
        events: Mutex<Vec<ResilienceEvent>>,
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn record(&self, event: &ResilienceEvent) -> Result<(), EventSinkError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct StuckSink;

    #[async_trait]
    impl EventSink for StuckSink {
        async fn record(&self, _event: &ResilienceEvent) -> Result<(), EventSinkError> {
            std::future::pending().await
        }
    }

    #[derive(Debug)]
    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn record(&self, _event: &ResilienceEvent) -> Result<(), EventSinkError> {
            Err(EventSinkError::Unavailable("collector offline".into()))
        }
    }

    fn rejected(category: &str) -> ResilienceEvent {
        ResilienceEvent::CallRejected {
            category: category.to_string(),
            state: CircuitState::Open,
            retry_after: Some(Duration::from_secs(5)),
        }
    }

    #[tokio::test]
    async fn test_events_delivered_and_drained_on_shutdown() {
        let sink = Arc::new(CollectingSink::default());
        let shutdown = CancellationToken::new();
        let (reporter, worker) =
            EventReporter::spawn(sink.clone(), EventReporterConfig::default(), shutdown.clone());

        for name in ["a", "b", "c"] {
            reporter.emit(rejected(name));
        }
        shutdown.cancel();
        worker.await.unwrap();

        let categories: Vec<String> =
            sink.events.lock().iter().map(|e| e.category().to_string()).collect();
        assert_eq!(categories, vec!["a", "b", "c"]);
        let stats = reporter.stats();
        assert_eq!(stats.queued, 3);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.dropped, 0);
    }

    /// Validates `EventReporter::emit` for the full queue scenario.
    ///
    /// Assertions:
    /// - Emitting into a full queue returns immediately.
    /// - Overflowing events are counted as dropped.
    #[tokio::test]
    async fn test_full_queue_drops_events() {
        let config = EventReporterConfig { capacity: 1, delivery_timeout: Duration::from_secs(1) };
        let (reporter, _worker) =
            EventReporter::spawn(Arc::new(StuckSink), config, CancellationToken::new());

        // The worker has not been polled yet on this single-threaded runtime.
        reporter.emit(rejected("a"));
        reporter.emit(rejected("b"));
        reporter.emit(rejected("c"));

        let stats = reporter.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_sink_times_out() {
        let config =
            EventReporterConfig { capacity: 8, delivery_timeout: Duration::from_millis(100) };
        let (reporter, _worker) =
            EventReporter::spawn(Arc::new(StuckSink), config, CancellationToken::new());

        reporter.emit(rejected("a"));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(reporter.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_failing_sink_counted() {
        let shutdown = CancellationToken::new();
        let (reporter, worker) = EventReporter::spawn(
            Arc::new(FailingSink),
            EventReporterConfig::default(),
            shutdown.clone(),
        );

        reporter.emit(rejected("a"));
        shutdown.cancel();
        worker.await.unwrap();

        assert_eq!(reporter.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_emit_after_shutdown_is_dropped() {
        let shutdown = CancellationToken::new();
        let (reporter, worker) = EventReporter::spawn(
            Arc::new(TracingEventSink),
            EventReporterConfig::default(),
            shutdown.clone(),
        );
        shutdown.cancel();
        worker.await.unwrap();

        reporter.emit(rejected("late"));
        assert_eq!(reporter.stats().dropped, 1);
    }

    /// Validates that the default sink writes events through tracing.
    ///
    /// Assertions:
    /// - Transitions are logged at INFO with the category and target state.
    /// - Exhausted retries are logged at WARN.
    /// - Rejections are DEBUG and filtered out at INFO.
    #[tokio::test]
    async fn test_tracing_sink_writes_log_lines() {
        let (logs, _guard) = CapturedLogs::install(tracing::Level::INFO);

        let sink = TracingEventSink;
        sink.record(&ResilienceEvent::CircuitTransition {
            category: "search".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            failures: 3,
            timestamp_ms: 0,
        })
        .await
        .unwrap();
        sink.record(&ResilienceEvent::RetryExhausted {
            category: "search".into(),
            attempts: 4,
            elapsed: Duration::from_millis(1500),
        })
        .await
        .unwrap();
        sink.record(&rejected("hidden")).await.unwrap();

        let text = logs.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2, "unexpected output: {text}");
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].contains("circuit transition"));
        assert!(lines[0].contains("to=OPEN"));
        assert!(lines[1].contains("WARN"));
        assert!(lines[1].contains("attempts=4"));
        assert!(!text.contains("hidden"));
    }

    #[test]
    fn test_event_labels() {
        let event = ResilienceEvent::RetryScheduled {
            category: "search".into(),
            attempt: 2,
            delay: Duration::from_millis(400),
            class: ErrorClass::Transient,
        };
        assert_eq!(event.kind(), "retry_scheduled");
        assert_eq!(event.category(), "search");
    }
}
