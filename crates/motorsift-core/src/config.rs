//! Engine and per-source configuration.
//!
//! All values are supplied externally (TOML file, environment); nothing here
//! hard-codes a source.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Adapter variant, as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Stateless HTTP source, safe to call concurrently.
    Api,
    /// Browser-automation source that borrows a pooled session.
    Automation,
}

/// Token bucket parameters for one (source, operation) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens replenished per `period_ms`.
    pub rate: u32,
    pub period_ms: u64,
    /// Bucket capacity. Defaults to `rate`.
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimitConfig {
    pub fn new(rate: u32, period: Duration) -> Self {
        Self {
            rate,
            period_ms: period.as_millis() as u64,
            burst: None,
        }
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn capacity(&self) -> u32 {
        self.burst.unwrap_or(self.rate)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Bounded retry with exponential backoff for a single adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    2_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the given retry (1-indexed), doubling and capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Per-source metadata. Adapter-specific settings live with the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: AdapterKind,
    #[serde(default = "default_source_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub daily_quota: Option<u64>,
    /// How many listings to request from this source per search.
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    /// Documented staleness of this source's data. Lower wins dedup ties.
    #[serde(default)]
    pub staleness_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_true() -> bool {
    true
}

fn default_source_timeout_ms() -> u64 {
    10_000
}

fn default_max_results() -> u32 {
    50
}

impl SourceConfig {
    pub fn new(id: impl Into<String>, kind: AdapterKind) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            kind,
            timeout_ms: default_source_timeout_ms(),
            rate_limit: None,
            daily_quota: None,
            max_results: default_max_results(),
            staleness_secs: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_daily_quota(mut self, quota: u64) -> Self {
        self.daily_quota = Some(quota);
        self
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness_secs = Some(staleness.as_secs());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.id.trim().is_empty() {
            return Err(AppError::ConfigError("source id must not be empty".into()));
        }
        if self.timeout_ms == 0 {
            return Err(AppError::ConfigError(format!(
                "source '{}': timeout_ms must be positive",
                self.id
            )));
        }
        if let Some(rl) = &self.rate_limit
            && (rl.rate == 0 || rl.period_ms == 0 || rl.capacity() == 0)
        {
            return Err(AppError::ConfigError(format!(
                "source '{}': rate limit rate, period and burst must be positive",
                self.id
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::ConfigError(format!(
                "source '{}': retry.max_attempts must be at least 1",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Wall-clock budget for one whole search call.
    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,
    /// Hand newly discovered listings to the listing store.
    #[serde(default = "default_true")]
    pub write_back: bool,
    /// Source id of the local pre-fetched tier, excluded from write-back.
    #[serde(default = "default_local_source")]
    pub local_source_id: String,
    /// Absolute price difference under which two VIN-less listings can match.
    #[serde(default = "default_price_tolerance")]
    pub dedup_price_tolerance: u32,
    /// Relative price difference (percent) under which two VIN-less listings can match.
    #[serde(default = "default_price_tolerance_pct")]
    pub dedup_price_tolerance_pct: f64,
}

fn default_overall_timeout_ms() -> u64 {
    15_000
}

fn default_local_source() -> String {
    "local".to_string()
}

fn default_price_tolerance() -> u32 {
    250
}

fn default_price_tolerance_pct() -> f64 {
    2.0
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            overall_timeout_ms: default_overall_timeout_ms(),
            write_back: true,
            local_source_id: default_local_source(),
            dedup_price_tolerance: default_price_tolerance(),
            dedup_price_tolerance_pct: default_price_tolerance_pct(),
        }
    }
}

impl SchedulerConfig {
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL of the process-local (hot) tier.
    #[serde(default = "default_fast_ttl_secs")]
    pub fast_ttl_secs: u64,
    /// TTL of the durable (warm) tier.
    #[serde(default = "default_durable_ttl_secs")]
    pub durable_ttl_secs: u64,
    #[serde(default = "default_fast_capacity")]
    pub fast_capacity: u64,
    /// Misses after which a query counts as popular for pre-warming.
    #[serde(default = "default_popular_threshold")]
    pub popular_threshold: u64,
    /// Distinct queries whose miss counts are tracked; the least useful are evicted.
    #[serde(default = "default_popular_capacity")]
    pub popular_capacity: u64,
    /// Average fetch latency above which a source is a pre-warm candidate.
    #[serde(default = "default_slow_source_ms")]
    pub slow_source_ms: u64,
    /// Interval of the background durable-tier purge; 0 disables it.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

fn default_fast_ttl_secs() -> u64 {
    300
}

fn default_durable_ttl_secs() -> u64 {
    6 * 60 * 60
}

fn default_fast_capacity() -> u64 {
    1_000
}

fn default_popular_threshold() -> u64 {
    3
}

fn default_popular_capacity() -> u64 {
    10_000
}

fn default_slow_source_ms() -> u64 {
    5_000
}

fn default_purge_interval_secs() -> u64 {
    15 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fast_ttl_secs: default_fast_ttl_secs(),
            durable_ttl_secs: default_durable_ttl_secs(),
            fast_capacity: default_fast_capacity(),
            popular_threshold: default_popular_threshold(),
            popular_capacity: default_popular_capacity(),
            slow_source_ms: default_slow_source_ms(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn fast_ttl(&self) -> Duration {
        Duration::from_secs(self.fast_ttl_secs)
    }

    pub fn durable_ttl(&self) -> Duration {
        Duration::from_secs(self.durable_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Resources created at start and kept idle.
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// Soft ceiling on extra resources created when the pool is empty.
    #[serde(default = "default_max_overflow")]
    pub max_overflow: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_pool_size() -> usize {
    2
}

fn default_max_overflow() -> usize {
    2
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            max_overflow: default_max_overflow(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Number of successful probes in half-open state to close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Cool-down before an open circuit admits a probe.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// When the upstream rate-limits us, multiply the cool-down by this factor.
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_backoff_multiplier: f32,

    /// Maximum cool-down after rate limit backoffs.
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_rate_limit_multiplier() -> f32 {
    2.0
}

fn default_max_cooldown_ms() -> u64 {
    300_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_ms: default_cooldown_ms(),
            rate_limit_backoff_multiplier: default_rate_limit_multiplier(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
}

impl EngineConfig {
    /// Apply environment overrides on top of file/default values.
    ///
    /// - `MOTORSIFT_OVERALL_TIMEOUT_MS`
    /// - `MOTORSIFT_POOL_SIZE`
    /// - `MOTORSIFT_FAST_TTL_SECS`
    pub fn with_env_overrides(mut self) -> Result<Self, AppError> {
        if let Some(v) = env_number("MOTORSIFT_OVERALL_TIMEOUT_MS")? {
            self.scheduler.overall_timeout_ms = v;
        }
        if let Some(v) = env_number("MOTORSIFT_POOL_SIZE")? {
            self.pool.size = v as usize;
        }
        if let Some(v) = env_number("MOTORSIFT_FAST_TTL_SECS")? {
            self.cache.fast_ttl_secs = v;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.scheduler.overall_timeout_ms == 0 {
            return Err(AppError::ConfigError(
                "scheduler.overall_timeout_ms must be positive".into(),
            ));
        }
        if self.circuit.failure_threshold == 0 || self.circuit.success_threshold == 0 {
            return Err(AppError::ConfigError(
                "circuit thresholds must be at least 1".into(),
            ));
        }
        if self.cache.fast_capacity == 0 {
            return Err(AppError::ConfigError(
                "cache.fast_capacity must be at least 1".into(),
            ));
        }
        if self.scheduler.dedup_price_tolerance_pct < 0.0 {
            return Err(AppError::ConfigError(
                "scheduler.dedup_price_tolerance_pct must not be negative".into(),
            ));
        }
        Ok(())
    }
}

fn env_number(name: &str) -> Result<Option<u64>, AppError> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw.trim().parse::<u64>().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {name} '{raw}': must be a non-negative integer"))
        }),
    }
}
