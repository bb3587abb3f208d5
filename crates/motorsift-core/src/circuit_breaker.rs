//! Per-source circuit breaker.
//!
//! Stops calling a source that keeps failing, then probes it with a single
//! call once the cool-down has elapsed.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[cool-down]--> HALF_OPEN (one probe)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <---------------------------[success]----------------------------+
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::CircuitBreakerConfig;
use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - one probe request is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
    last_error_message: Option<String>,
    current_cooldown: Duration,
    error_counts: BTreeMap<&'static str, u64>,
    total_successes: u64,
    total_failures: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            open_until: None,
            probe_in_flight: false,
            last_error_message: None,
            current_cooldown: config.cooldown(),
            error_counts: BTreeMap::new(),
            total_successes: 0,
            total_failures: 0,
        }
    }

    fn remaining_cooldown(&self) -> Duration {
        self.open_until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

/// Snapshot of circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open_ms: Option<u64>,
    /// Advisory counters per error kind. Not used for state transitions.
    pub error_counts: BTreeMap<String, u64>,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Thread-safe circuit breaker guarding one source.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open_ms = (inner.state == CircuitState::Open)
            .then(|| inner.remaining_cooldown().as_millis() as u64);

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_error: inner.last_error_message.clone(),
            time_until_half_open_ms,
            error_counts: inner
                .error_counts
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }

    /// Admission check before invoking the source.
    ///
    /// In half-open state only one caller gets through; it must report back
    /// with `record_success`, `record_failure` or `cancel_probe`.
    pub fn try_acquire(&self) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                tracing::debug!(circuit = %self.name, "Admitting half-open probe");
                Ok(())
            }
            CircuitState::HalfOpen => Err(AppError::SourceCircuitOpen {
                source_id: self.name.clone(),
                retry_after_ms: 0,
            }),
            CircuitState::Open => Err(AppError::SourceCircuitOpen {
                source_id: self.name.clone(),
                retry_after_ms: inner.remaining_cooldown().as_millis() as u64,
            }),
        }
    }

    /// Give back an admitted probe that was never dispatched.
    pub fn cancel_probe(&self) {
        let mut inner = self.lock_inner();
        inner.probe_in_flight = false;
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns `AppError::SourceCircuitOpen` immediately
    /// - HalfOpen: executes one probe, transitions based on result
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.try_acquire()?;

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => self.cancel_probe(),
        }

        result
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        inner.total_successes += 1;
        inner.probe_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker closing after {} successful probes",
                        inner.success_count
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.open_until = None;
                    inner.last_error_message = None;
                    inner.current_cooldown = self.config.cooldown();
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            // A straggler from before the circuit opened.
            CircuitState::Open => {
                inner.failure_count = 0;
            }
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        let is_rate_limit = error.is_upstream_rate_limit();

        inner.total_failures += 1;
        inner.probe_in_flight = false;
        *inner.error_counts.entry(error.kind_label()).or_insert(0) += 1;
        inner.last_error_message = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    if is_rate_limit {
                        self.extend_cooldown(&mut inner);
                    }
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.success_count = 0;
                if is_rate_limit {
                    self.extend_cooldown(&mut inner);
                }
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.open_until = None;
        inner.probe_in_flight = false;
        inner.last_error_message = None;
        inner.current_cooldown = self.config.cooldown();
    }

    fn open(&self, inner: &mut CircuitBreakerInner) {
        inner.state = CircuitState::Open;
        inner.open_until = Some(Instant::now() + inner.current_cooldown);
    }

    fn extend_cooldown(&self, inner: &mut CircuitBreakerInner) {
        inner.current_cooldown = std::cmp::min(
            Duration::from_secs_f32(
                inner.current_cooldown.as_secs_f32() * self.config.rate_limit_backoff_multiplier,
            ),
            self.config.max_cooldown(),
        );
        tracing::info!(
            circuit = %self.name,
            cooldown_ms = inner.current_cooldown.as_millis() as u64,
            "Extended cool-down due to upstream rate limit"
        );
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(until) = inner.open_until
            && Instant::now() >= until
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.probe_in_flight = false;
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamErrorKind;

    fn config(failure_threshold: u32, cooldown_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            cooldown_ms,
            ..Default::default()
        }
    }

    fn network_error() -> AppError {
        AppError::NetworkError("test".into())
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_circuit_opens_after_threshold_failures() {
        let cb = CircuitBreaker::new("test", config(3, 60_000));

        for _ in 0..3 {
            cb.record_failure(&network_error());
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(
            cb.try_acquire(),
            Err(AppError::SourceCircuitOpen { retry_after_ms, .. }) if retry_after_ms > 0
        ));
    }

    #[test]
    fn test_circuit_stays_closed_below_threshold() {
        let cb = CircuitBreaker::new("test", config(5, 60_000));

        for _ in 0..4 {
            cb.record_failure(&network_error());
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", config(5, 60_000));

        for _ in 0..4 {
            cb.record_failure(&network_error());
        }
        cb.record_success();
        for _ in 0..4 {
            cb.record_failure(&network_error());
        }

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_transitions_to_half_open() {
        let cb = CircuitBreaker::new("test", config(1, 10));

        cb.record_failure(&network_error());
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let cb = CircuitBreaker::new("test", config(1, 1));

        cb.record_failure(&network_error());
        std::thread::sleep(Duration::from_millis(5));

        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_err());

        cb.cancel_probe();
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_half_open_closes_on_probe_success() {
        let cb = CircuitBreaker::new("test", config(1, 1));

        cb.record_failure(&network_error());
        std::thread::sleep(Duration::from_millis(5));

        assert!(cb.try_acquire().is_ok());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_needs_configured_successes() {
        let cfg = CircuitBreakerConfig {
            success_threshold: 2,
            ..config(1, 1)
        };
        let cb = CircuitBreaker::new("test", cfg);

        cb.record_failure(&network_error());
        std::thread::sleep(Duration::from_millis(5));

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let cb = CircuitBreaker::new("test", config(1, 1));

        cb.record_failure(&network_error());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure(&network_error());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_rate_limit_extends_cooldown() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown_ms: 30_000,
            rate_limit_backoff_multiplier: 2.0,
            max_cooldown_ms: 300_000,
            ..Default::default()
        };
        let cb = CircuitBreaker::new("test", cfg);

        cb.record_failure(&AppError::upstream("test", UpstreamErrorKind::RateLimited, "429"));

        let stats = cb.stats();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(stats.time_until_half_open_ms.unwrap() > 55_000);
    }

    #[test]
    fn test_rate_limit_backoff_capped_at_max() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            cooldown_ms: 200_000,
            rate_limit_backoff_multiplier: 2.0,
            max_cooldown_ms: 300_000,
        };
        let cb = CircuitBreaker::new("test", cfg);

        cb.record_failure(&AppError::upstream("test", UpstreamErrorKind::RateLimited, "429"));

        let stats = cb.stats();
        assert!(stats.time_until_half_open_ms.unwrap() <= 300_000);
    }

    #[test]
    fn test_error_counts_by_kind() {
        let cb = CircuitBreaker::new("test", config(10, 60_000));

        cb.record_failure(&AppError::upstream("test", UpstreamErrorKind::Parse, "bad"));
        cb.record_failure(&AppError::upstream("test", UpstreamErrorKind::Parse, "bad"));
        cb.record_failure(&AppError::SourceTimeout {
            source_id: "test".into(),
            timeout_ms: 10,
        });
        cb.record_success();

        let stats = cb.stats();
        assert_eq!(stats.error_counts.get("parse"), Some(&2));
        assert_eq!(stats.error_counts.get("timeout"), Some(&1));
        assert_eq!(stats.total_failures, 3);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.failure_count, 0);
    }

    #[test]
    fn test_manual_reset() {
        let cb = CircuitBreaker::new("test", config(1, 300_000));

        cb.record_failure(&network_error());
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_call_rejects_without_running_when_open() {
        let cb = CircuitBreaker::new("test", config(1, 60_000));
        cb.record_failure(&network_error());

        let mut ran = false;
        let result = cb
            .call(|| {
                ran = true;
                async { Ok::<_, AppError>("should not execute".to_string()) }
            })
            .await;

        assert!(matches!(result, Err(AppError::SourceCircuitOpen { .. })));
        assert!(!ran);
    }

    #[tokio::test]
    async fn test_call_executes_when_closed() {
        let cb = CircuitBreaker::new("test", CircuitBreakerConfig::default());

        let result = cb
            .call(|| async { Ok::<_, AppError>("success".to_string()) })
            .await;

        assert_eq!(result.unwrap(), "success");
    }

    #[tokio::test]
    async fn test_call_ignores_not_found() {
        let cb = CircuitBreaker::new("test", config(1, 60_000));

        let _ = cb
            .call(|| async {
                Err::<String, _>(AppError::upstream("test", UpstreamErrorKind::NotFound, "none"))
            })
            .await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failure_count, 0);
    }
}
