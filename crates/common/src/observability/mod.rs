//! Observability primitives for the resilience layer
//!
//! Structured logs go through `tracing` and counters through `metrics`
//! directly at the call sites. This module adds the asynchronous event
//! pipeline (events/) that fans resilience events out to pluggable sinks
//! without blocking the calls that produce them.

#[cfg(test)]
pub(crate) mod capture;
pub mod events;

pub use events::{
    EventReporter, EventReporterConfig, EventReporterStats, EventSink, EventSinkError,
    ResilienceEvent, TracingEventSink,
};
