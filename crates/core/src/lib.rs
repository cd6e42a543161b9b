//! # RelayGate Core
//!
//! Backend domain layer on top of the `relaygate-common` resilience layer.
//!
//! This crate contains:
//! - The backend categories with their default circuit and retry settings
//! - The backend error type and its classification
//! - TOML settings for the resilience layer
//! - [`BackendGuard`], the facade request handlers call backends through
//! - Tracing initialisation
//!
//! ## Architecture Principles
//! - Only depends on `relaygate-common`
//! - Backend operations are opaque async closures supplied by callers
//! - No HTTP routing or request parsing

pub mod category;
pub mod config;
pub mod error;
pub mod guard;
pub mod logging;

pub use category::BackendCategory;
pub use config::{CategoryOverrides, ResilienceSettings};
pub use error::{BackendError, BackendResult};
pub use guard::{BackendGuard, GuardResult, HealthReport};
pub use logging::{init_tracing, LogFormat};
