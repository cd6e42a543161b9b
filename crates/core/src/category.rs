//! Backend categories and their default resilience settings
//!
//! Each category is guarded by its own circuit. Defaults reflect how each
//! backend fails: the git host rate-limits and recovers slowly, the language
//! server restarts within seconds, the filesystem indexer fails fast and
//! locally, package registries sit behind CDNs with moderate recovery.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use relaygate_common::error::CommonError;
use relaygate_common::resilience::{
    classify_io_kind, CircuitBreakerConfig, Classify, ErrorClass, FnClassifier, JitterRange,
    RetryPolicy, SelfClassifier, SharedClassifier,
};
use serde::{Deserialize, Serialize};

use crate::error::{classify_rpc_code, BackendError};

/// Backend category guarded by one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendCategory {
    /// Hosted version-control API
    VersionControl,
    /// Language server
    LanguageIntelligence,
    /// Local filesystem search and indexing
    LocalFilesystem,
    /// Package registries
    PackageRegistry,
}

impl BackendCategory {
    pub const ALL: [Self; 4] = [
        Self::VersionControl,
        Self::LanguageIntelligence,
        Self::LocalFilesystem,
        Self::PackageRegistry,
    ];

    /// Circuit name used in the registry, logs and metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::VersionControl => "version-control",
            Self::LanguageIntelligence => "language-intelligence",
            Self::LocalFilesystem => "local-filesystem",
            Self::PackageRegistry => "package-registry",
        }
    }

    /// Default circuit thresholds.
    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        let (failure_threshold, success_threshold, reset_secs) = match self {
            Self::VersionControl => (5, 2, 60),
            Self::LanguageIntelligence => (5, 2, 30),
            Self::LocalFilesystem => (10, 1, 10),
            Self::PackageRegistry => (5, 2, 60),
        };
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            reset_timeout: Duration::from_secs(reset_secs),
        }
    }

    /// Default retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        let (max_attempts, initial_ms, backoff_multiplier, max_delay_secs) = match self {
            Self::VersionControl => (3, 1000, 3.0, 30),
            Self::LanguageIntelligence => (4, 500, 2.0, 10),
            Self::LocalFilesystem => (2, 100, 2.0, 2),
            Self::PackageRegistry => (3, 750, 2.0, 15),
        };
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_secs(max_delay_secs),
            backoff_multiplier,
            jitter: JitterRange::default(),
        }
    }

    /// Error classifier for this category.
    ///
    /// HTTP-backed categories use the error's own classification, which maps
    /// 403/429 to rate-limited and 408/5xx to transient.
    pub fn classifier(&self) -> SharedClassifier<BackendError> {
        match self {
            Self::VersionControl | Self::PackageRegistry => Arc::new(SelfClassifier),
            Self::LanguageIntelligence => Arc::new(FnClassifier::new(classify_language_server)),
            Self::LocalFilesystem => Arc::new(FnClassifier::new(classify_filesystem)),
        }
    }
}

/// The language server is reached over a local pipe: a broken or refused
/// connection means it is restarting.
fn classify_language_server(error: &BackendError) -> ErrorClass {
    match error {
        BackendError::Rpc { code, .. } => classify_rpc_code(*code),
        BackendError::Io { .. } | BackendError::Timeout { .. } => ErrorClass::Transient,
        other => other.classify(),
    }
}

/// Local I/O has no server to back off from: rate-limit signals are treated
/// as plain transient failures and HTTP or RPC errors never apply.
fn classify_filesystem(error: &BackendError) -> ErrorClass {
    match error {
        BackendError::Io { source, .. } => classify_io_kind(source.kind()),
        BackendError::Timeout { .. } => ErrorClass::Transient,
        BackendError::Common(common) => match common.classify() {
            ErrorClass::RateLimited { .. } => ErrorClass::Transient,
            other => other,
        },
        _ => ErrorClass::Fatal,
    }
}

impl fmt::Display for BackendCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendCategory {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|category| category.as_str() == s).ok_or_else(|| {
            CommonError::validation_with_value("category", "unknown backend category", s)
        })
    }
}
