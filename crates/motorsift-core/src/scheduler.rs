//! Aggregation scheduler.
//!
//! Fans one logical search out to every eligible source concurrently and
//! folds the answers into a single ranked, deduplicated result. Per-source
//! failures never escape as errors: they are attributed in the result.
//!
//! Only the scheduler loop touches circuit breakers and progress events, so
//! a source's state and events are updated in one place, in order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{FetchCost, ResultCache};
use crate::circuit_breaker::{CircuitBreakerStats, CircuitState};
use crate::config::{SchedulerConfig, SourceConfig};
use crate::error::AppError;
use crate::merge::{self, PriceTolerance, SourceBatch};
use crate::models::{
    AggregationResult, CachedAggregate, FailureKind, HealthReport, HealthStatus, Listing,
    SearchRequest, SkipReason, SkippedSource, SourceFailure, normalize_text,
};
use crate::progress::{ProgressReporter, SourceStatus};
use crate::rate_limiter::{LimiterUsage, SEARCH_OP};
use crate::registry::{SourceEntry, SourceRegistry};
use crate::retry::retry_with_backoff;
use crate::traits::ListingStore;

/// Health of one source, as seen by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source: String,
    pub enabled: bool,
    pub circuit: CircuitState,
    pub report: HealthReport,
}

/// Configuration and runtime counters of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub config: SourceConfig,
    pub circuit: CircuitBreakerStats,
    pub usage: Option<LimiterUsage>,
    pub fetch_cost: Option<FetchCost>,
}

/// What came back from the sources for one live fetch.
#[derive(Debug, Default)]
struct FetchOutcome {
    batches: Vec<SourceBatch>,
    succeeded: Vec<String>,
    failed: Vec<SourceFailure>,
    skipped: Vec<SkippedSource>,
}

type TaskOutput = (Result<Vec<Listing>, AppError>, Duration);

pub struct Aggregator {
    registry: Arc<SourceRegistry>,
    cache: Arc<ResultCache>,
    progress: Arc<ProgressReporter>,
    store: Option<Arc<dyn ListingStore>>,
    config: SchedulerConfig,
}

impl Aggregator {
    pub fn new(registry: Arc<SourceRegistry>, cache: Arc<ResultCache>, config: SchedulerConfig) -> Self {
        Self {
            registry,
            cache,
            progress: Arc::new(ProgressReporter::new()),
            store: None,
            config,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_listing_store(mut self, store: Arc<dyn ListingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn progress(&self) -> &Arc<ProgressReporter> {
        &self.progress
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<AggregationResult, AppError> {
        self.search_with_session(request, Uuid::new_v4()).await
    }

    /// Run a search whose progress is published under `session_id`.
    ///
    /// Errors only for an invalid request or an empty registry.
    pub async fn search_with_session(
        &self,
        request: &SearchRequest,
        session_id: Uuid,
    ) -> Result<AggregationResult, AppError> {
        let started = Instant::now();
        request.validate()?;
        if self.registry.is_empty() {
            return Err(AppError::ConfigError("no sources configured".into()));
        }

        let key = request.cache_key();
        if let Some(entry) = self.cache.get(&key).await {
            tracing::info!(session = %session_id, key = %key, "Serving search from cache");
            self.progress.start_search(session_id, &[]);
            self.progress.complete(session_id);
            return Ok(build_result(
                &entry.payload,
                request,
                key,
                session_id,
                started,
                true,
            ));
        }

        self.cache.record_miss(&key, request);
        let payload = self.run_live(request, &key, session_id, started).await;
        self.progress.complete(session_id);

        let result = build_result(&payload, request, key, session_id, started, false);
        tracing::info!(
            session = %session_id,
            total = result.total,
            succeeded = result.sources_succeeded.len(),
            failed = result.sources_failed.len(),
            skipped = result.sources_skipped.len(),
            elapsed_ms = result.elapsed_ms,
            "Search completed"
        );
        Ok(result)
    }

    /// Re-fetch the most-missed queries so the next caller hits the cache.
    /// Returns how many were refreshed.
    pub async fn prewarm(&self, limit: usize) -> usize {
        let mut refreshed = 0;
        for popular in self.cache.popular_queries(limit) {
            let session_id = Uuid::new_v4();
            let payload = self
                .run_live(&popular.request, &popular.cache_key, session_id, Instant::now())
                .await;
            self.progress.complete(session_id);
            if !payload.sources_succeeded.is_empty() {
                refreshed += 1;
            }
        }
        tracing::info!(refreshed, "Cache pre-warm finished");
        refreshed
    }

    /// Probe every registered source concurrently, each within its timeout.
    pub async fn health_check_all(&self) -> Vec<SourceHealth> {
        let checks = self.registry.entries().into_iter().map(|entry| async move {
            let config = entry.config();
            let started = Instant::now();
            let report = match tokio::time::timeout(config.timeout(), entry.adapter().health_check()).await {
                Ok(report) => report,
                Err(_) => HealthReport::with_status(
                    HealthStatus::Unhealthy,
                    started.elapsed(),
                    format!("health check timed out after {} ms", config.timeout_ms),
                ),
            };
            SourceHealth {
                source: config.id,
                enabled: config.enabled,
                circuit: entry.breaker().state(),
                report,
            }
        });
        futures::future::join_all(checks).await
    }

    pub fn source_stats(&self) -> Vec<SourceStats> {
        self.registry
            .entries()
            .into_iter()
            .map(|entry| SourceStats {
                usage: self.registry.limiter().usage(entry.id(), SEARCH_OP),
                fetch_cost: self.cache.fetch_cost(entry.id()),
                circuit: entry.breaker().stats(),
                config: entry.config(),
            })
            .collect()
    }

    /// Close a source's circuit by hand. Returns false for an unknown source.
    pub fn reset_source(&self, source_id: &str) -> bool {
        match self.registry.get(source_id) {
            Some(entry) => {
                entry.breaker().reset();
                true
            }
            None => false,
        }
    }

    /// Periodically purge expired cache entries and abandoned progress
    /// sessions until cancelled.
    pub async fn run_maintenance(&self, interval: Duration, cancel: CancellationToken) {
        if interval.is_zero() {
            return;
        }
        tracing::info!(interval_secs = interval.as_secs(), "Cache maintenance started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match self.cache.purge_expired().await {
                        Ok(purged) => tracing::debug!(purged, "Purged expired cache entries"),
                        Err(e) => tracing::warn!(error = %e, "Cache purge failed"),
                    }
                    self.progress.prune_abandoned();
                }
            }
        }
        tracing::info!("Cache maintenance stopped");
    }

    /// Fetch, merge, rank, cache and write back. Never fails.
    async fn run_live(
        &self,
        request: &SearchRequest,
        key: &str,
        session_id: Uuid,
        started: Instant,
    ) -> CachedAggregate {
        let outcome = self.fetch_all(request, session_id, started).await;

        let mut listings = merge::dedup(outcome.batches, PriceTolerance::from_config(&self.config));
        merge::rank(&mut listings, request);

        let payload = CachedAggregate {
            listings,
            sources_succeeded: outcome.succeeded,
            sources_failed: outcome.failed,
            sources_skipped: outcome.skipped,
        };

        if payload.sources_succeeded.is_empty() {
            tracing::debug!(key = %key, "No source succeeded, not caching");
        } else {
            self.cache.set(key, payload.clone()).await;
            self.write_back(&payload.listings);
        }
        payload
    }

    fn write_back(&self, listings: &[Listing]) {
        let Some(store) = &self.store else {
            return;
        };
        if !self.config.write_back {
            return;
        }
        let fresh: Vec<Listing> = listings
            .iter()
            .filter(|l| l.source != self.config.local_source_id)
            .cloned()
            .collect();
        if fresh.is_empty() {
            return;
        }

        let store = Arc::clone(store);
        tokio::spawn(async move {
            match store.upsert_listings(&fresh).await {
                Ok(written) => tracing::debug!(written, "Wrote back listings"),
                Err(e) => tracing::warn!(error = %e, "Listing write-back failed"),
            }
        });
    }

    async fn fetch_all(
        &self,
        request: &SearchRequest,
        session_id: Uuid,
        started: Instant,
    ) -> FetchOutcome {
        let mut outcome = FetchOutcome::default();
        let candidates = self.select_candidates(request, &mut outcome.skipped);

        let mut announced: Vec<String> = candidates.iter().map(|e| e.id().to_string()).collect();
        announced.extend(outcome.skipped.iter().map(|s| s.source.clone()));
        self.progress.start_search(session_id, &announced);
        for skipped in &outcome.skipped {
            self.progress.update_source(
                session_id,
                &skipped.source,
                SourceStatus::Skipped,
                Some(skipped.reason.to_string()),
            );
        }

        let order: HashMap<String, usize> = candidates
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id().to_string(), i))
            .collect();

        let mut pending = FuturesUnordered::new();
        let mut outstanding: HashMap<String, Arc<SourceEntry>> = HashMap::new();

        for entry in candidates {
            if let Some(reason) = self.admit(&entry) {
                tracing::debug!(session = %session_id, source = %entry.id(), %reason, "Skipping source");
                self.progress.update_source(
                    session_id,
                    entry.id(),
                    SourceStatus::Skipped,
                    Some(reason.to_string()),
                );
                outcome.skipped.push(SkippedSource {
                    source: entry.id().to_string(),
                    reason,
                });
                continue;
            }

            let id = entry.id().to_string();
            let handle = tokio::spawn(call_source(entry.clone(), request.clone()));
            pending.push(async move { (id, handle.await) });
            outstanding.insert(entry.id().to_string(), entry);
        }

        let deadline = tokio::time::Instant::from_std(started) + self.config.overall_timeout();
        let mut batches: Vec<(usize, SourceBatch)> = Vec::new();

        loop {
            let Ok(Some((id, joined))) = tokio::time::timeout_at(deadline, pending.next()).await
            else {
                break;
            };
            let Some(entry) = outstanding.remove(&id) else {
                continue;
            };

            let (result, elapsed) = match joined {
                Ok(output) => output,
                Err(join_error) => (
                    Err(AppError::Generic(format!("source task aborted: {join_error}"))),
                    Duration::ZERO,
                ),
            };

            match result {
                Ok(mut listings) => {
                    entry.breaker().record_success();
                    self.cache.record_fetch(&id, elapsed, true);
                    for listing in &mut listings {
                        listing.source.clone_from(&id);
                    }
                    self.progress.update_source(
                        session_id,
                        &id,
                        SourceStatus::Succeeded,
                        Some(format!("{} listings in {} ms", listings.len(), elapsed.as_millis())),
                    );
                    let config = entry.config();
                    batches.push((
                        order.get(&id).copied().unwrap_or(usize::MAX),
                        SourceBatch {
                            source: id.clone(),
                            staleness_secs: config.staleness_secs,
                            listings,
                        },
                    ));
                    outcome.succeeded.push(id);
                }
                Err(e) => {
                    self.cache.record_fetch(&id, elapsed, false);
                    self.record_failure(&entry, &e, session_id, &mut outcome.failed);
                }
            }
        }

        // Stragglers past the overall deadline: stop waiting, keep them running.
        // Their tasks still finish (and release pooled sessions) on their own.
        let mut stragglers: Vec<Arc<SourceEntry>> = outstanding.into_values().collect();
        stragglers.sort_by_key(|e| order.get(e.id()).copied().unwrap_or(usize::MAX));
        for entry in stragglers {
            let error = AppError::SourceTimeout {
                source_id: entry.id().to_string(),
                timeout_ms: self.config.overall_timeout_ms,
            };
            self.record_failure(&entry, &error, session_id, &mut outcome.failed);
        }

        batches.sort_by_key(|(position, _)| *position);
        outcome.batches = batches.into_iter().map(|(_, batch)| batch).collect();
        outcome.succeeded.sort_by_key(|id| order.get(id).copied().unwrap_or(usize::MAX));
        outcome
            .failed
            .sort_by_key(|f| order.get(&f.source).copied().unwrap_or(usize::MAX));
        outcome
    }

    /// Enabled sources in source id order, narrowed by the allow-list.
    ///
    /// Allow-listed names that are unknown or disabled are recorded as skipped.
    fn select_candidates(
        &self,
        request: &SearchRequest,
        skipped: &mut Vec<SkippedSource>,
    ) -> Vec<Arc<SourceEntry>> {
        let entries = self.registry.entries();
        let allow: Option<HashSet<String>> = request
            .sources
            .as_ref()
            .map(|names| names.iter().map(|n| normalize_text(n)).collect());

        let Some(allow) = allow else {
            return entries.into_iter().filter(|e| e.is_enabled()).collect();
        };

        let known: HashSet<String> = entries.iter().map(|e| normalize_text(e.id())).collect();
        let mut unknown: Vec<&String> = allow.iter().filter(|n| !known.contains(*n)).collect();
        unknown.sort();
        skipped.extend(unknown.into_iter().map(|name| SkippedSource {
            source: name.clone(),
            reason: SkipReason::NotConfigured,
        }));

        let mut candidates = Vec::new();
        for entry in entries {
            if !allow.contains(&normalize_text(entry.id())) {
                continue;
            }
            if entry.is_enabled() {
                candidates.push(entry);
            } else {
                skipped.push(SkippedSource {
                    source: entry.id().to_string(),
                    reason: SkipReason::Disabled,
                });
            }
        }
        candidates
    }

    /// Circuit breaker first, then rate limiter. `Some` means skip.
    fn admit(&self, entry: &SourceEntry) -> Option<SkipReason> {
        if let Err(e) = entry.breaker().try_acquire() {
            let retry_after_ms = match e {
                AppError::SourceCircuitOpen { retry_after_ms, .. } => retry_after_ms,
                _ => 0,
            };
            return Some(SkipReason::CircuitOpen { retry_after_ms });
        }

        match self.registry.limiter().check(entry.id(), SEARCH_OP, 1) {
            Ok(()) => None,
            Err(e) => {
                entry.breaker().cancel_probe();
                match e {
                    AppError::DailyQuotaExceeded { .. } => Some(SkipReason::DailyQuotaExceeded),
                    _ => Some(SkipReason::RateLimited),
                }
            }
        }
    }

    fn record_failure(
        &self,
        entry: &SourceEntry,
        error: &AppError,
        session_id: Uuid,
        failed: &mut Vec<SourceFailure>,
    ) {
        if error.should_trip_circuit() {
            entry.breaker().record_failure(error);
        } else {
            entry.breaker().cancel_probe();
        }
        self.progress.update_source(
            session_id,
            entry.id(),
            SourceStatus::Failed,
            Some(error.to_string()),
        );
        failed.push(SourceFailure {
            source: entry.id().to_string(),
            kind: FailureKind::from_error(error),
            message: error.to_string(),
        });
    }
}

/// One source call: retries inside the per-source timeout.
async fn call_source(entry: Arc<SourceEntry>, request: SearchRequest) -> TaskOutput {
    let config = entry.config();
    let adapter = Arc::clone(entry.adapter());
    let started = Instant::now();

    let attempt = retry_with_backoff(&config.retry, AppError::is_retryable, |_| {
        adapter.search(&request, 1, config.max_results)
    });

    let result = match tokio::time::timeout(config.timeout(), attempt).await {
        Ok(result) => result,
        Err(_) => Err(AppError::SourceTimeout {
            source_id: config.id.clone(),
            timeout_ms: config.timeout_ms,
        }),
    };
    (result, started.elapsed())
}

fn build_result(
    payload: &CachedAggregate,
    request: &SearchRequest,
    cache_key: String,
    session_id: Uuid,
    started: Instant,
    cached: bool,
) -> AggregationResult {
    AggregationResult {
        listings: merge::paginate(&payload.listings, request.page, request.page_size),
        total: payload.listings.len(),
        page: request.page,
        page_size: request.page_size,
        sources_succeeded: payload.sources_succeeded.clone(),
        sources_failed: payload.sources_failed.clone(),
        sources_skipped: payload.sources_skipped.clone(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        partial: !payload.sources_failed.is_empty() || !payload.sources_skipped.is_empty(),
        cached,
        cache_key,
        session_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AdapterKind, CacheConfig, CircuitBreakerConfig, RateLimitConfig, RetryPolicy,
    };
    use crate::progress::ProgressEvent;
    use crate::traits::SourceAdapter;
    use crate::testutil::{MockAdapter, MockListingStore, sample_listings};

    struct Harness {
        registry: Arc<SourceRegistry>,
        scheduler: SchedulerConfig,
    }

    impl Harness {
        fn new() -> Self {
            let circuit = CircuitBreakerConfig {
                failure_threshold: 2,
                cooldown_ms: 60_000,
                ..Default::default()
            };
            Self {
                registry: Arc::new(SourceRegistry::new(circuit)),
                scheduler: SchedulerConfig {
                    overall_timeout_ms: 2_000,
                    ..Default::default()
                },
            }
        }

        fn with_overall_timeout(mut self, ms: u64) -> Self {
            self.scheduler.overall_timeout_ms = ms;
            self
        }

        fn source(self, config: SourceConfig, adapter: &MockAdapter) -> Self {
            self.registry
                .register(config.with_retry(RetryPolicy::no_retry()), Arc::new(adapter.clone()))
                .unwrap();
            self
        }

        fn api(self, adapter: &MockAdapter) -> Self {
            let config = SourceConfig::new(adapter.id(), AdapterKind::Api);
            self.source(config, adapter)
        }

        fn build(self) -> Aggregator {
            Aggregator::new(
                self.registry,
                Arc::new(ResultCache::new(CacheConfig::default())),
                self.scheduler,
            )
        }
    }

    fn request() -> SearchRequest {
        SearchRequest::new().with_make("Honda").with_page(1, 50)
    }

    #[tokio::test]
    async fn partial_result_with_timeout_and_open_circuit() {
        let a = MockAdapter::with_listings("a", sample_listings("a", 5));
        let b = MockAdapter::new("b").with_delay(Duration::from_secs(5));
        let c = MockAdapter::with_listings("c", sample_listings("c", 3));

        let aggregator = Harness::new()
            .api(&a)
            .source(
                SourceConfig::new("b", AdapterKind::Api).with_timeout(Duration::from_millis(50)),
                &b,
            )
            .api(&c)
            .build();

        let entry = aggregator.registry().get("c").unwrap();
        entry.breaker().record_failure(&AppError::NetworkError("down".into()));
        entry.breaker().record_failure(&AppError::NetworkError("down".into()));

        let result = aggregator.search(&request()).await.unwrap();

        assert_eq!(result.total, 5);
        assert_eq!(result.sources_succeeded, vec!["a".to_string()]);
        assert_eq!(result.sources_failed.len(), 1);
        assert_eq!(result.sources_failed[0].source, "b");
        assert_eq!(result.sources_failed[0].kind, FailureKind::Timeout);
        assert_eq!(result.sources_skipped.len(), 1);
        assert_eq!(result.sources_skipped[0].source, "c");
        assert!(matches!(
            result.sources_skipped[0].reason,
            SkipReason::CircuitOpen { .. }
        ));
        assert!(result.partial);
        assert!(!result.cached);
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test]
    async fn second_identical_request_is_served_from_cache() {
        let a = MockAdapter::with_listings("a", sample_listings("a", 4));
        let aggregator = Harness::new().api(&a).build();

        let first = aggregator.search(&request()).await.unwrap();
        let second = aggregator
            .search(&SearchRequest::new().with_make("  HONDA ").with_page(1, 50))
            .await
            .unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.total, 4);
        assert_eq!(second.cache_key, first.cache_key);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn pages_are_served_from_one_cached_merge() {
        let a = MockAdapter::with_listings("a", sample_listings("a", 30));
        let aggregator = Harness::new().api(&a).build();

        let first = aggregator
            .search(&SearchRequest::new().with_page(1, 20))
            .await
            .unwrap();
        let second = aggregator
            .search(&SearchRequest::new().with_page(2, 20))
            .await
            .unwrap();

        assert_eq!(first.listings.len(), 20);
        assert_eq!(second.listings.len(), 10);
        assert!(second.cached);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn all_sources_failing_returns_empty_partial_result_in_time() {
        let a = MockAdapter::new("a").with_delay(Duration::from_secs(10));
        let b = MockAdapter::failing("b", crate::error::UpstreamErrorKind::Unknown);
        let aggregator = Harness::new()
            .with_overall_timeout(150)
            .source(
                SourceConfig::new("a", AdapterKind::Api).with_timeout(Duration::from_secs(30)),
                &a,
            )
            .api(&b)
            .build();

        let started = Instant::now();
        let result = aggregator.search(&request()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.total, 0);
        assert!(result.partial);
        assert!(result.sources_succeeded.is_empty());
        assert_eq!(result.sources_failed.len(), 2);
        assert_eq!(result.sources_failed[0].source, "a");
        assert_eq!(result.sources_failed[0].kind, FailureKind::Timeout);
        assert_eq!(result.sources_failed[1].kind, FailureKind::Unknown);
    }

    #[tokio::test]
    async fn failed_results_are_not_cached() {
        let a = MockAdapter::failing("a", crate::error::UpstreamErrorKind::Parse);
        let aggregator = Harness::new().api(&a).build();

        aggregator.search(&request()).await.unwrap();
        let second = aggregator.search(&request()).await.unwrap();

        assert!(!second.cached);
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_and_stops_calls() {
        let a = MockAdapter::failing("a", crate::error::UpstreamErrorKind::Unknown);
        let aggregator = Harness::new().api(&a).build();

        for make in ["ford", "kia", "audi"] {
            aggregator
                .search(&SearchRequest::new().with_make(make))
                .await
                .unwrap();
        }

        assert_eq!(a.calls(), 2);
        let stats = aggregator.source_stats();
        assert_eq!(stats[0].circuit.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn not_found_does_not_trip_circuit() {
        let a = MockAdapter::failing("a", crate::error::UpstreamErrorKind::NotFound);
        let aggregator = Harness::new().api(&a).build();

        for make in ["ford", "kia", "audi"] {
            aggregator
                .search(&SearchRequest::new().with_make(make))
                .await
                .unwrap();
        }

        assert_eq!(a.calls(), 3);
        assert_eq!(
            aggregator.registry().get("a").unwrap().breaker().state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn rate_limited_and_quota_sources_are_skipped() {
        let a = MockAdapter::with_listings("a", sample_listings("a", 1));
        let b = MockAdapter::with_listings("b", sample_listings("b", 1));
        let aggregator = Harness::new()
            .source(
                SourceConfig::new("a", AdapterKind::Api)
                    .with_rate_limit(RateLimitConfig::new(1, Duration::from_secs(3600))),
                &a,
            )
            .source(SourceConfig::new("b", AdapterKind::Api).with_daily_quota(1), &b)
            .build();

        aggregator.search(&SearchRequest::new().with_make("ford")).await.unwrap();
        let result = aggregator
            .search(&SearchRequest::new().with_make("kia"))
            .await
            .unwrap();

        assert_eq!(result.total, 0);
        assert_eq!(
            result.sources_skipped,
            vec![
                SkippedSource {
                    source: "a".into(),
                    reason: SkipReason::RateLimited
                },
                SkippedSource {
                    source: "b".into(),
                    reason: SkipReason::DailyQuotaExceeded
                },
            ]
        );
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn allow_list_narrows_candidates() {
        let a = MockAdapter::with_listings("a", sample_listings("a", 2));
        let b = MockAdapter::with_listings("b", sample_listings("b", 2));
        let c = MockAdapter::with_listings("c", sample_listings("c", 2));
        let aggregator = Harness::new()
            .api(&a)
            .api(&b)
            .source(SourceConfig::new("c", AdapterKind::Api).disabled(), &c)
            .build();

        let result = aggregator
            .search(&SearchRequest::new().with_sources(["B", "c", "nope"]))
            .await
            .unwrap();

        assert_eq!(result.sources_succeeded, vec!["b".to_string()]);
        assert_eq!(a.calls(), 0);
        assert_eq!(c.calls(), 0);
        let reasons: Vec<_> = result
            .sources_skipped
            .iter()
            .map(|s| (s.source.as_str(), s.reason.clone()))
            .collect();
        assert!(reasons.contains(&("nope", SkipReason::NotConfigured)));
        assert!(reasons.contains(&("c", SkipReason::Disabled)));
    }

    #[tokio::test]
    async fn disabled_sources_are_not_candidates() {
        let a = MockAdapter::with_listings("a", sample_listings("a", 2));
        let b = MockAdapter::with_listings("b", sample_listings("b", 2));
        let aggregator = Harness::new().api(&a).api(&b).build();

        aggregator.registry().set_enabled("b", false);
        let result = aggregator.search(&request()).await.unwrap();

        assert_eq!(result.sources_succeeded, vec!["a".to_string()]);
        assert!(result.sources_skipped.is_empty());
        assert!(!result.partial);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn duplicates_across_sources_are_merged() {
        let mut from_a = sample_listings("a", 2);
        from_a[0].vin = Some("1FTFW1E50NFA00001".into());
        let mut from_b = sample_listings("b", 1);
        from_b[0].vin = Some("1ftfw1e50nfa00001".into());

        let a = MockAdapter::with_listings("a", from_a);
        let b = MockAdapter::with_listings("b", from_b);
        let aggregator = Harness::new()
            .source(SourceConfig::new("a", AdapterKind::Api).with_staleness(Duration::from_secs(3600)), &a)
            .source(SourceConfig::new("b", AdapterKind::Api).with_staleness(Duration::from_secs(60)), &b)
            .build();

        let result = aggregator.search(&request()).await.unwrap();

        assert_eq!(result.total, 2);
        let vin_owner = result
            .listings
            .iter()
            .find(|l| l.vin.is_some())
            .map(|l| l.source.clone());
        assert_eq!(vin_owner.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let a = MockAdapter::with_listings("a", sample_listings("a", 1))
            .with_responses(vec![Err(AppError::NetworkError("reset".into()))]);
        let registry = Arc::new(SourceRegistry::new(CircuitBreakerConfig::default()));
        registry
            .register(
                SourceConfig::new("a", AdapterKind::Api).with_retry(RetryPolicy {
                    max_attempts: 2,
                    base_delay_ms: 1,
                    max_delay_ms: 1,
                }),
                Arc::new(a.clone()),
            )
            .unwrap();
        let aggregator = Aggregator::new(
            registry,
            Arc::new(ResultCache::new(CacheConfig::default())),
            SchedulerConfig::default(),
        );

        let result = aggregator.search(&request()).await.unwrap();

        assert_eq!(result.total, 1);
        assert!(!result.partial);
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn progress_events_follow_search() {
        let a = MockAdapter::with_listings("a", sample_listings("a", 1));
        let b = MockAdapter::failing("b", crate::error::UpstreamErrorKind::Parse);
        let aggregator = Harness::new().api(&a).api(&b).build();

        let session = Uuid::new_v4();
        let mut rx = aggregator.progress().subscribe(session);
        aggregator.search_with_session(&request(), session).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(events.len(), 5);
        assert!(events[..2].iter().all(|e| matches!(
            e,
            ProgressEvent::Source { status: SourceStatus::Started, .. }
        )));
        assert_eq!(
            events[4],
            ProgressEvent::Finished {
                session_id: session,
                succeeded: 1,
                failed: 1,
                skipped: 0
            }
        );
    }

    #[tokio::test]
    async fn write_back_skips_local_source() {
        let local = MockAdapter::with_listings("local", sample_listings("local", 2));
        let remote = MockAdapter::with_listings("remote", sample_listings("remote", 3));
        let store = MockListingStore::new();

        let harness = Harness::new().api(&local).api(&remote);
        let aggregator = Aggregator::new(
            harness.registry,
            Arc::new(ResultCache::new(CacheConfig::default())),
            harness.scheduler,
        )
        .with_listing_store(Arc::new(store.clone()));

        aggregator.search(&request()).await.unwrap();

        let mut saved = Vec::new();
        for _ in 0..50 {
            saved = store.saved();
            if !saved.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(saved.len(), 3);
        assert!(saved.iter().all(|l| l.source == "remote"));
    }

    #[tokio::test]
    async fn prewarm_refreshes_popular_queries() {
        let a = MockAdapter::with_listings("a", sample_listings("a", 1));
        let registry = Arc::new(SourceRegistry::new(CircuitBreakerConfig::default()));
        registry
            .register(SourceConfig::new("a", AdapterKind::Api), Arc::new(a.clone()))
            .unwrap();
        let cache = Arc::new(ResultCache::new(CacheConfig {
            popular_threshold: 1,
            ..CacheConfig::default()
        }));
        let aggregator = Aggregator::new(registry, Arc::clone(&cache), SchedulerConfig::default());

        aggregator.search(&request()).await.unwrap();
        assert_eq!(aggregator.prewarm(5).await, 1);
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn rejects_invalid_request_and_empty_registry() {
        let empty = Harness::new().build();
        assert!(matches!(
            empty.search(&request()).await,
            Err(AppError::ConfigError(_))
        ));

        let a = MockAdapter::new("a");
        let aggregator = Harness::new().api(&a).build();
        let invalid = SearchRequest::new().with_years(Some(2020), Some(2000));
        assert!(matches!(
            aggregator.search(&invalid).await,
            Err(AppError::InvalidRequest(_))
        ));
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn health_check_all_reports_every_source() {
        let a = MockAdapter::new("a");
        let b = MockAdapter::new("b").with_health(HealthStatus::Unhealthy);
        let aggregator = Harness::new().api(&a).api(&b).build();

        let health = aggregator.health_check_all().await;

        assert_eq!(health.len(), 2);
        assert_eq!(health[0].report.status, HealthStatus::Healthy);
        assert_eq!(health[1].report.status, HealthStatus::Unhealthy);
        assert_eq!(health[1].circuit, CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_source_closes_circuit() {
        let a = MockAdapter::new("a");
        let aggregator = Harness::new().api(&a).build();
        let entry = aggregator.registry().get("a").unwrap();
        entry.breaker().record_failure(&AppError::NetworkError("x".into()));
        entry.breaker().record_failure(&AppError::NetworkError("x".into()));

        assert!(aggregator.reset_source("a"));
        assert_eq!(entry.breaker().state(), CircuitState::Closed);
        assert!(!aggregator.reset_source("missing"));
    }

    #[tokio::test]
    async fn maintenance_stops_on_cancel() {
        let aggregator = Harness::new().build();
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            aggregator.run_maintenance(Duration::from_secs(60), cancel),
        )
        .await
        .unwrap();
    }
}
