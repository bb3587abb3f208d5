//! Per-(source, operation) admission control.
//!
//! Each configured pair owns a GCRA token bucket (`governor`, refilled lazily
//! from elapsed time at acquisition) and an optional daily ceiling that resets
//! at the local-day boundary. Pairs that were never configured are unlimited.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use governor::clock::DefaultClock;
use governor::state::InMemoryState;
use governor::state::direct::NotKeyed;
use governor::Quota;
use serde::Serialize;

use crate::config::RateLimitConfig;
use crate::error::AppError;

/// Operation name the scheduler acquires for a listing search.
pub const SEARCH_OP: &str = "search";

type DirectRateLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Returns the current local day. Injectable for day-rollover tests.
pub type DayFn = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

#[derive(Debug)]
struct DailyCounter {
    day: NaiveDate,
    used: u64,
}

struct Bucket {
    limiter: Option<DirectRateLimiter>,
    rate_limit: Option<RateLimitConfig>,
    daily_quota: Option<u64>,
    daily: Mutex<DailyCounter>,
}

/// Point-in-time usage for one (source, operation) pair.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterUsage {
    pub key: String,
    pub daily_used: u64,
    pub daily_quota: Option<u64>,
    pub rate_limit: Option<RateLimitConfig>,
}

pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
    today: DayFn,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_day_source(Arc::new(|| chrono::Local::now().date_naive()))
    }

    pub fn with_day_source(today: DayFn) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            today,
        }
    }

    /// Install (or replace) the limits for a pair.
    pub fn configure(
        &self,
        source_id: &str,
        operation: &str,
        rate_limit: Option<RateLimitConfig>,
        daily_quota: Option<u64>,
    ) -> Result<(), AppError> {
        let key = bucket_key(source_id, operation);
        let limiter = rate_limit
            .map(|rl| quota_for(&key, &rl).map(DirectRateLimiter::direct))
            .transpose()?;

        let bucket = Bucket {
            limiter,
            rate_limit,
            daily_quota,
            daily: Mutex::new(DailyCounter {
                day: (self.today)(),
                used: 0,
            }),
        };

        let mut buckets = self.buckets.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter registry");
            poisoned.into_inner()
        });
        buckets.insert(key, Arc::new(bucket));
        Ok(())
    }

    /// Non-blocking admission. `false` means the call must not be made.
    pub fn try_acquire(&self, source_id: &str, operation: &str, tokens: u32) -> bool {
        self.check(source_id, operation, tokens).is_ok()
    }

    /// Non-blocking admission that says why it denied.
    pub fn check(&self, source_id: &str, operation: &str, tokens: u32) -> Result<(), AppError> {
        let key = bucket_key(source_id, operation);
        let Some(bucket) = self.bucket(&key) else {
            return Ok(());
        };
        let Some(n) = NonZeroU32::new(tokens) else {
            return Ok(());
        };

        let mut daily = self.lock_daily(&key, &bucket);
        self.roll_day(&mut daily);

        if let Some(limit) = bucket.daily_quota
            && daily.used + u64::from(tokens) > limit
        {
            return Err(AppError::DailyQuotaExceeded { key, limit });
        }

        if let Some(limiter) = &bucket.limiter {
            match limiter.check_n(n) {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    tracing::debug!(key = %key, tokens, "Rate limiter denied");
                    return Err(AppError::SourceRateLimited(source_id.to_string()));
                }
            }
        }

        daily.used += u64::from(tokens);
        Ok(())
    }

    /// Wait for tokens and return how long that took.
    ///
    /// Fails fast with `DailyQuotaExceeded` instead of waiting once the daily
    /// ceiling is reached. Requests larger than the bucket capacity fail with
    /// `SourceRateLimited` since they could never be admitted.
    pub async fn wait_and_acquire(
        &self,
        source_id: &str,
        operation: &str,
        tokens: u32,
    ) -> Result<Duration, AppError> {
        let started = Instant::now();
        let key = bucket_key(source_id, operation);
        let Some(bucket) = self.bucket(&key) else {
            return Ok(Duration::ZERO);
        };
        let Some(n) = NonZeroU32::new(tokens) else {
            return Ok(Duration::ZERO);
        };

        {
            let mut daily = self.lock_daily(&key, &bucket);
            self.roll_day(&mut daily);
            if let Some(limit) = bucket.daily_quota
                && daily.used + u64::from(tokens) > limit
            {
                return Err(AppError::DailyQuotaExceeded { key, limit });
            }
            // Reserve now so concurrent waiters cannot overshoot the ceiling.
            daily.used += u64::from(tokens);
        }

        if let Some(limiter) = &bucket.limiter
            && limiter.until_n_ready(n).await.is_err()
        {
            let mut daily = self.lock_daily(&key, &bucket);
            daily.used = daily.used.saturating_sub(u64::from(tokens));
            return Err(AppError::SourceRateLimited(source_id.to_string()));
        }

        let waited = started.elapsed();
        if !waited.is_zero() {
            tracing::debug!(key = %key, waited_ms = waited.as_millis() as u64, "Waited for rate limiter");
        }
        Ok(waited)
    }

    pub fn usage(&self, source_id: &str, operation: &str) -> Option<LimiterUsage> {
        let key = bucket_key(source_id, operation);
        let bucket = self.bucket(&key)?;
        let mut daily = self.lock_daily(&key, &bucket);
        self.roll_day(&mut daily);
        Some(LimiterUsage {
            daily_used: daily.used,
            daily_quota: bucket.daily_quota,
            rate_limit: bucket.rate_limit,
            key,
        })
    }

    fn bucket(&self, key: &str) -> Option<Arc<Bucket>> {
        let buckets = self.buckets.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limiter registry");
            poisoned.into_inner()
        });
        buckets.get(key).cloned()
    }

    fn lock_daily<'a>(
        &self,
        key: &str,
        bucket: &'a Bucket,
    ) -> std::sync::MutexGuard<'a, DailyCounter> {
        bucket.daily.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(key = %key, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn roll_day(&self, daily: &mut DailyCounter) {
        let today = (self.today)();
        if today != daily.day {
            daily.day = today;
            daily.used = 0;
        }
    }
}

fn bucket_key(source_id: &str, operation: &str) -> String {
    format!("{source_id}:{operation}")
}

fn quota_for(key: &str, rl: &RateLimitConfig) -> Result<Quota, AppError> {
    let invalid = || AppError::ConfigError(format!("invalid rate limit for '{key}'"));

    let rate = NonZeroU32::new(rl.rate).ok_or_else(invalid)?;
    let burst = NonZeroU32::new(rl.capacity()).ok_or_else(invalid)?;
    let replenish = rl.period() / rate.get();

    Quota::with_period(replenish)
        .map(|q| q.allow_burst(burst))
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;

    fn limiter_with(rate: u32, period: Duration, quota: Option<u64>) -> RateLimiter {
        let limiter = RateLimiter::new();
        limiter
            .configure("src", SEARCH_OP, Some(RateLimitConfig::new(rate, period)), quota)
            .unwrap();
        limiter
    }

    #[test]
    fn denies_beyond_capacity() {
        let limiter = limiter_with(3, Duration::from_secs(60), None);

        for _ in 0..3 {
            assert!(limiter.try_acquire("src", SEARCH_OP, 1));
        }
        assert!(!limiter.try_acquire("src", SEARCH_OP, 1));
        assert!(matches!(
            limiter.check("src", SEARCH_OP, 1),
            Err(AppError::SourceRateLimited(_))
        ));
    }

    #[test]
    fn operations_are_independent() {
        let limiter = limiter_with(1, Duration::from_secs(60), None);

        assert!(limiter.try_acquire("src", SEARCH_OP, 1));
        assert!(!limiter.try_acquire("src", SEARCH_OP, 1));
        // Never configured: unlimited.
        assert!(limiter.try_acquire("src", "health", 1));
        assert!(limiter.try_acquire("other", SEARCH_OP, 1));
    }

    #[test]
    fn burst_overrides_capacity() {
        let limiter = RateLimiter::new();
        limiter
            .configure(
                "src",
                SEARCH_OP,
                Some(RateLimitConfig::new(10, Duration::from_secs(60)).with_burst(2)),
                None,
            )
            .unwrap();

        assert!(limiter.try_acquire("src", SEARCH_OP, 1));
        assert!(limiter.try_acquire("src", SEARCH_OP, 1));
        assert!(!limiter.try_acquire("src", SEARCH_OP, 1));
    }

    #[test]
    fn refills_after_period() {
        let limiter = limiter_with(1, Duration::from_millis(30), None);

        assert!(limiter.try_acquire("src", SEARCH_OP, 1));
        assert!(!limiter.try_acquire("src", SEARCH_OP, 1));

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.try_acquire("src", SEARCH_OP, 1));
    }

    #[test]
    fn daily_quota_caps_usage() {
        let limiter = limiter_with(100, Duration::from_secs(1), Some(2));

        assert!(limiter.try_acquire("src", SEARCH_OP, 1));
        assert!(limiter.try_acquire("src", SEARCH_OP, 1));
        assert!(matches!(
            limiter.check("src", SEARCH_OP, 1),
            Err(AppError::DailyQuotaExceeded { limit: 2, .. })
        ));

        let usage = limiter.usage("src", SEARCH_OP).unwrap();
        assert_eq!(usage.daily_used, 2);
        assert_eq!(usage.daily_quota, Some(2));
    }

    #[test]
    fn denied_bucket_does_not_consume_quota() {
        let limiter = limiter_with(1, Duration::from_secs(60), Some(10));

        assert!(limiter.try_acquire("src", SEARCH_OP, 1));
        assert!(!limiter.try_acquire("src", SEARCH_OP, 1));
        assert_eq!(limiter.usage("src", SEARCH_OP).unwrap().daily_used, 1);
    }

    #[test]
    fn daily_quota_resets_on_new_day() {
        let offset = Arc::new(AtomicI64::new(0));
        let base = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let day_offset = offset.clone();
        let limiter = RateLimiter::with_day_source(Arc::new(move || {
            base + chrono::Days::new(day_offset.load(Ordering::SeqCst) as u64)
        }));
        limiter.configure("src", SEARCH_OP, None, Some(1)).unwrap();

        assert!(limiter.try_acquire("src", SEARCH_OP, 1));
        assert!(!limiter.try_acquire("src", SEARCH_OP, 1));

        offset.store(1, Ordering::SeqCst);
        assert!(limiter.try_acquire("src", SEARCH_OP, 1));
    }

    #[tokio::test]
    async fn wait_and_acquire_fails_fast_on_quota() {
        let limiter = limiter_with(1, Duration::from_secs(3600), Some(1));

        assert!(limiter.wait_and_acquire("src", SEARCH_OP, 1).await.is_ok());

        let started = Instant::now();
        let result = limiter.wait_and_acquire("src", SEARCH_OP, 1).await;
        assert!(matches!(result, Err(AppError::DailyQuotaExceeded { .. })));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn wait_and_acquire_waits_for_refill() {
        let limiter = limiter_with(1, Duration::from_millis(80), None);

        let first = limiter.wait_and_acquire("src", SEARCH_OP, 1).await.unwrap();
        assert!(first < Duration::from_millis(20));

        let second = limiter.wait_and_acquire("src", SEARCH_OP, 1).await.unwrap();
        assert!(second >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn wait_and_acquire_rejects_oversized_request() {
        let limiter = limiter_with(2, Duration::from_secs(1), Some(10));

        let result = limiter.wait_and_acquire("src", SEARCH_OP, 5).await;
        assert!(matches!(result, Err(AppError::SourceRateLimited(_))));
        assert_eq!(limiter.usage("src", SEARCH_OP).unwrap().daily_used, 0);
    }

    #[test]
    fn rejects_zero_rate() {
        let limiter = RateLimiter::new();
        let result = limiter.configure(
            "src",
            SEARCH_OP,
            Some(RateLimitConfig::new(0, Duration::from_secs(1))),
            None,
        );
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
