//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` or atomics for interior mutability, so a
//! test can keep a clone and assert on recorded calls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::automation::AutomationScript;
use crate::cache::CacheEntry;
use crate::config::AdapterKind;
use crate::error::{AppError, UpstreamErrorKind};
use crate::models::{HealthReport, HealthStatus, Listing, SearchRequest};
use crate::pool::ResourceManager;
use crate::traits::{DurableCache, ListingStore, SourceAdapter};

/// `n` distinct listings attributed to `source`, cheapest first.
pub fn sample_listings(source: &str, n: usize) -> Vec<Listing> {
    (0..n)
        .map(|i| {
            let mut listing = Listing::new(source, format!("{source}-{i}"), format!("{source} vehicle {i}"));
            listing.year = Some(2015 + (i % 8) as u16);
            listing.price = Some(10_000 + i as u32 * 1_000);
            listing.mileage = Some(20_000 + i as u32 * 5_000);
            listing
        })
        .collect()
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Mock source adapter.
///
/// Each call pops the next scripted response; once the script is exhausted
/// it returns the default listings, or a fresh error when built with
/// [`MockAdapter::failing`].
#[derive(Clone)]
pub struct MockAdapter {
    id: String,
    kind: AdapterKind,
    listings: Vec<Listing>,
    fail_kind: Option<UpstreamErrorKind>,
    responses: Arc<Mutex<Vec<Result<Vec<Listing>, AppError>>>>,
    delay: Option<Duration>,
    health: HealthStatus,
    calls: Arc<AtomicUsize>,
}

impl MockAdapter {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: AdapterKind::Api,
            listings: Vec::new(),
            fail_kind: None,
            responses: Arc::new(Mutex::new(Vec::new())),
            delay: None,
            health: HealthStatus::Healthy,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_listings(id: &str, listings: Vec<Listing>) -> Self {
        Self {
            listings,
            ..Self::new(id)
        }
    }

    /// Always fails with an upstream error of the given kind.
    pub fn failing(id: &str, kind: UpstreamErrorKind) -> Self {
        Self {
            fail_kind: Some(kind),
            ..Self::new(id)
        }
    }

    pub fn with_kind(mut self, kind: AdapterKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_responses(self, responses: Vec<Result<Vec<Listing>, AppError>>) -> Self {
        *self.responses.lock().unwrap() = responses;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AdapterKind {
        self.kind
    }

    async fn search(
        &self,
        _request: &SearchRequest,
        _page: u32,
        page_size: u32,
    ) -> Result<Vec<Listing>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = {
            let mut responses = self.responses.lock().unwrap();
            (!responses.is_empty()).then(|| responses.remove(0))
        };
        if let Some(response) = scripted {
            return response;
        }
        if let Some(kind) = self.fail_kind {
            return Err(AppError::upstream(&self.id, kind, "mock failure"));
        }
        Ok(self.listings.iter().take(page_size as usize).cloned().collect())
    }

    async fn health_check(&self) -> HealthReport {
        match self.health {
            HealthStatus::Healthy => HealthReport::healthy(Duration::from_millis(1)),
            status => HealthReport::with_status(status, Duration::from_millis(1), "mock"),
        }
    }
}

// ---------------------------------------------------------------------------
// MockDurableCache
// ---------------------------------------------------------------------------

/// In-memory durable cache tier.
#[derive(Clone, Default)]
pub struct MockDurableCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    get_calls: Arc<AtomicUsize>,
    failing: bool,
}

impl MockDurableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation fails with `CacheUnavailable`.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn insert(&self, entry: CacheEntry) {
        self.entries.lock().unwrap().insert(entry.key.clone(), entry);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing {
            return Err(AppError::CacheUnavailable("mock durable tier is down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableCache for MockDurableCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, AppError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), AppError> {
        self.check()?;
        self.insert(entry.clone());
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), AppError> {
        self.check()?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        self.check()?;
        let now = chrono::Utc::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok((before - entries.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// MockListingStore
// ---------------------------------------------------------------------------

/// Records every listing written back.
#[derive(Clone, Default)]
pub struct MockListingStore {
    saved: Arc<Mutex<Vec<Listing>>>,
}

impl MockListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<Listing> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl ListingStore for MockListingStore {
    async fn upsert_listings(&self, listings: &[Listing]) -> Result<u64, AppError> {
        self.saved.lock().unwrap().extend_from_slice(listings);
        Ok(listings.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// MockSessionManager / MockScript
// ---------------------------------------------------------------------------

/// A fake browser session.
#[derive(Debug)]
pub struct MockSession {
    pub id: u64,
    pub searches: u32,
}

/// Pool manager that hands out numbered [`MockSession`]s.
#[derive(Clone, Default)]
pub struct MockSessionManager {
    pub created: Arc<AtomicU64>,
    pub resets: Arc<AtomicU64>,
    pub closed: Arc<AtomicU64>,
}

impl MockSessionManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceManager for MockSessionManager {
    type Resource = MockSession;

    async fn create(&self) -> Result<MockSession, AppError> {
        let id = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession { id, searches: 0 })
    }

    async fn reset(&self, session: &mut MockSession) -> Result<(), AppError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        session.searches = 0;
        Ok(())
    }

    async fn close(&self, _session: MockSession) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Automation script with a canned answer.
pub struct MockScript {
    listings: Vec<Listing>,
    error: Mutex<Option<AppError>>,
    delay: Option<Duration>,
}

impl MockScript {
    pub fn returning(listings: Vec<Listing>) -> Self {
        Self {
            listings,
            error: Mutex::new(None),
            delay: None,
        }
    }

    /// Fails the first search with `error`, then returns nothing.
    pub fn failing(error: AppError) -> Self {
        Self {
            listings: Vec::new(),
            error: Mutex::new(Some(error)),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl AutomationScript<MockSession> for MockScript {
    async fn search(
        &self,
        session: &mut MockSession,
        _request: &SearchRequest,
        _page: u32,
        _page_size: u32,
    ) -> Result<Vec<Listing>, AppError> {
        session.searches += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.error.lock().unwrap().take() {
            return Err(error);
        }
        Ok(self.listings.clone())
    }

    async fn health_check(&self, _session: &mut MockSession) -> Result<(), AppError> {
        Ok(())
    }
}
