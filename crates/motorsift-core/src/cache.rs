//! Two-tier result cache.
//!
//! The fast tier is an in-process `moka` cache with a short TTL. The durable
//! tier is any [`DurableCache`] (PostgreSQL in production) with a longer TTL.
//! Durable hits are promoted into the fast tier. A broken durable tier is
//! logged and treated as a miss; it never fails a search.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;
use crate::error::AppError;
use crate::models::{CachedAggregate, SearchRequest};
use crate::traits::DurableCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    /// Fast tier, minutes.
    Hot,
    /// Durable tier, hours.
    Warm,
}

impl TtlClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtlClass::Hot => "hot",
            TtlClass::Warm => "warm",
        }
    }
}

/// One cached merge. Never mutated after it is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: CachedAggregate,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ttl_class: TtlClass,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, payload: CachedAggregate, ttl_class: TtlClass, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            key: key.into(),
            payload,
            created_at,
            expires_at: created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            ttl_class,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct Popularity {
    request: SearchRequest,
    misses: AtomicU64,
}

/// A query that missed the cache often enough to be worth pre-warming.
#[derive(Debug, Clone, Serialize)]
pub struct PopularQuery {
    pub cache_key: String,
    pub request: SearchRequest,
    pub misses: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FetchCost {
    pub fetches: u64,
    pub failures: u64,
    pub total_ms: u64,
}

impl FetchCost {
    pub fn average_ms(&self) -> u64 {
        self.total_ms.checked_div(self.fetches).unwrap_or(0)
    }
}

pub struct ResultCache {
    fast: Cache<String, Arc<CacheEntry>>,
    durable: Option<Arc<dyn DurableCache>>,
    config: CacheConfig,
    /// Bounded by `popular_capacity`; queries idle for a durable TTL are dropped.
    popularity: moka::sync::Cache<String, Arc<Popularity>>,
    fetch_costs: Mutex<HashMap<String, FetchCost>>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        let fast = Cache::builder()
            .max_capacity(config.fast_capacity)
            .time_to_live(config.fast_ttl())
            .build();
        let popularity = moka::sync::Cache::builder()
            .max_capacity(config.popular_capacity)
            .time_to_idle(config.durable_ttl())
            .build();
        Self {
            fast,
            durable: None,
            config,
            popularity,
            fetch_costs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_durable(mut self, durable: Arc<dyn DurableCache>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn has_durable_tier(&self) -> bool {
        self.durable.is_some()
    }

    /// Look up a key in the fast tier, then the durable tier.
    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let now = Utc::now();

        if let Some(entry) = self.fast.get(key).await {
            if !entry.is_expired(now) {
                tracing::debug!(key = %key, "Fast cache hit");
                return Some(entry);
            }
            self.fast.invalidate(key).await;
        }

        let durable = self.durable.as_ref()?;
        match durable.get(key).await {
            Ok(Some(entry)) if !entry.is_expired(now) => {
                tracing::debug!(key = %key, "Durable cache hit, promoting");
                let promoted = Arc::new(CacheEntry::new(
                    key,
                    entry.payload,
                    TtlClass::Hot,
                    self.config.fast_ttl(),
                ));
                self.fast.insert(key.to_string(), Arc::clone(&promoted)).await;
                Some(promoted)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Durable cache unavailable, treating as miss");
                None
            }
        }
    }

    /// Write a merged result to both tiers.
    pub async fn set(&self, key: &str, payload: CachedAggregate) {
        let warm = CacheEntry::new(key, payload, TtlClass::Warm, self.config.durable_ttl());
        if let Some(durable) = &self.durable
            && let Err(e) = durable.put(&warm).await
        {
            tracing::warn!(key = %key, error = %e, "Durable cache write failed");
        }

        let hot = CacheEntry::new(key, warm.payload, TtlClass::Hot, self.config.fast_ttl());
        self.fast.insert(key.to_string(), Arc::new(hot)).await;
    }

    pub async fn invalidate(&self, key: &str) {
        self.fast.invalidate(key).await;
        if let Some(durable) = &self.durable
            && let Err(e) = durable.invalidate(key).await
        {
            tracing::warn!(key = %key, error = %e, "Durable cache invalidate failed");
        }
    }

    /// Evict expired entries from both tiers. Returns the durable count.
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        self.fast.run_pending_tasks().await;
        self.popularity.run_pending_tasks();
        match &self.durable {
            Some(durable) => durable.purge_expired().await,
            None => Ok(0),
        }
    }

    /// Count a miss that triggered a live fetch.
    pub fn record_miss(&self, key: &str, request: &SearchRequest) {
        let entry = self.popularity.get_with(key.to_string(), || {
            Arc::new(Popularity {
                request: request.normalized(),
                misses: AtomicU64::new(0),
            })
        });
        entry.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Most-missed queries at or above the popularity threshold, busiest first.
    pub fn popular_queries(&self, limit: usize) -> Vec<PopularQuery> {
        let mut queries: Vec<PopularQuery> = self
            .popularity
            .iter()
            .filter_map(|(key, p)| {
                let misses = p.misses.load(Ordering::Relaxed);
                (misses >= self.config.popular_threshold).then(|| PopularQuery {
                    cache_key: key.as_ref().clone(),
                    request: p.request.clone(),
                    misses,
                })
            })
            .collect();
        queries.sort_by(|a, b| b.misses.cmp(&a.misses).then_with(|| a.cache_key.cmp(&b.cache_key)));
        queries.truncate(limit);
        queries
    }

    pub fn record_fetch(&self, source_id: &str, elapsed: Duration, success: bool) {
        let mut costs = lock(&self.fetch_costs);
        let cost = costs.entry(source_id.to_string()).or_default();
        cost.fetches += 1;
        cost.total_ms += elapsed.as_millis() as u64;
        if !success {
            cost.failures += 1;
        }
    }

    pub fn fetch_cost(&self, source_id: &str) -> Option<FetchCost> {
        lock(&self.fetch_costs).get(source_id).copied()
    }

    /// Sources whose average fetch is slow enough to deserve pre-warming.
    pub fn prewarm_candidates(&self) -> Vec<String> {
        let costs = lock(&self.fetch_costs);
        let mut slow: Vec<String> = costs
            .iter()
            .filter(|(_, c)| c.average_ms() >= self.config.slow_source_ms)
            .map(|(id, _)| id.clone())
            .collect();
        slow.sort();
        slow
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned cache mutex");
        poisoned.into_inner()
    })
}
