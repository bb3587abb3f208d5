use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed taxonomy every adapter maps its source-specific failures into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamErrorKind {
    /// The upstream call did not answer in time.
    Timeout,
    /// The upstream itself refused us (HTTP 429, captcha wall, ...).
    RateLimited,
    /// The response could not be turned into listings.
    Parse,
    /// The upstream has nothing for this query.
    NotFound,
    Unknown,
}

impl UpstreamErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamErrorKind::Timeout => "timeout",
            UpstreamErrorKind::RateLimited => "rate_limited",
            UpstreamErrorKind::Parse => "parse",
            UpstreamErrorKind::NotFound => "not_found",
            UpstreamErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Application-wide error types for motorsift.
#[derive(Error, Debug)]
pub enum AppError {
    /// A source did not answer within its configured timeout.
    #[error("Source '{source_id}' timed out after {timeout_ms} ms")]
    SourceTimeout { source_id: String, timeout_ms: u64 },

    /// The local rate limiter denied the call.
    #[error("Source '{0}' denied by local rate limiter")]
    SourceRateLimited(String),

    /// The source's circuit is open; the adapter was not invoked.
    #[error("Circuit for source '{source_id}' is open. Retry after {retry_after_ms} ms")]
    SourceCircuitOpen {
        source_id: String,
        retry_after_ms: u64,
    },

    /// Adapter-reported failure.
    #[error("Source '{source_id}' failed ({kind}): {message}")]
    SourceUpstream {
        source_id: String,
        kind: UpstreamErrorKind,
        message: String,
    },

    /// The daily ceiling for a (source, operation) pair is used up.
    #[error("Daily quota of {limit} exhausted for '{key}'")]
    DailyQuotaExceeded { key: String, limit: u64 },

    /// No pooled resource became available within the acquire timeout.
    #[error("Resource pool exhausted after waiting {0} ms")]
    PoolExhausted(u64),

    /// The pool was shut down.
    #[error("Resource pool is shut down")]
    PoolClosed,

    /// Durable cache tier unreachable. Never fatal.
    #[error("Durable cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The search request failed its own invariant checks.
    #[error("Invalid search request: {0}")]
    InvalidRequest(String),

    /// Configuration is missing or inconsistent.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Shorthand for an adapter-reported failure.
    pub fn upstream(
        source_id: impl Into<String>,
        kind: UpstreamErrorKind,
        message: impl Into<String>,
    ) -> Self {
        AppError::SourceUpstream {
            source_id: source_id.into(),
            kind,
            message: message.into(),
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::SourceTimeout { .. } => true,
            AppError::SourceUpstream { kind, .. } => matches!(kind, UpstreamErrorKind::Timeout),
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }

    /// Returns true if this error should count against the source's circuit.
    ///
    /// A "not found" answer is a healthy upstream saying "no results"; local
    /// admission denials never reached the upstream at all.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::SourceUpstream { kind, .. } => *kind != UpstreamErrorKind::NotFound,
            AppError::SourceRateLimited(_)
            | AppError::SourceCircuitOpen { .. }
            | AppError::DailyQuotaExceeded { .. }
            | AppError::InvalidRequest(_)
            | AppError::ConfigError(_) => false,
            _ => true,
        }
    }

    /// Returns true if the upstream told us to slow down.
    pub fn is_upstream_rate_limit(&self) -> bool {
        matches!(
            self,
            AppError::SourceUpstream {
                kind: UpstreamErrorKind::RateLimited,
                ..
            }
        )
    }

    /// Short machine-readable label, used for per-kind error counters.
    pub fn kind_label(&self) -> &'static str {
        match self {
            AppError::SourceTimeout { .. } => "timeout",
            AppError::SourceRateLimited(_) => "local_rate_limited",
            AppError::SourceCircuitOpen { .. } => "circuit_open",
            AppError::SourceUpstream { kind, .. } => kind.as_str(),
            AppError::DailyQuotaExceeded { .. } => "daily_quota",
            AppError::PoolExhausted(_) => "pool_exhausted",
            AppError::PoolClosed => "pool_closed",
            AppError::CacheUnavailable(_) => "cache_unavailable",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::ConfigError(_) => "config",
            AppError::HttpError(_) => "http",
            AppError::NetworkError(_) => "network",
            AppError::DatabaseError(_) => "database",
            AppError::SerializationError(_) => "serialization",
            AppError::Generic(_) => "generic",
        }
    }
}
