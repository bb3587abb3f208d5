use async_trait::async_trait;

use crate::cache::CacheEntry;
use crate::config::AdapterKind;
use crate::error::AppError;
use crate::models::{HealthReport, Listing, SearchRequest};

/// Uniform contract every listing source implements.
///
/// Adapters map their own failures into `AppError::SourceUpstream` with an
/// `UpstreamErrorKind` so the scheduler can react to every source the same way.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Registry id of the source. Listings it returns carry this as `source`.
    fn id(&self) -> &str;

    fn kind(&self) -> AdapterKind;

    /// Fetch one page of listings matching the request's filters.
    async fn search(
        &self,
        request: &SearchRequest,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Listing>, AppError>;

    /// Cheap liveness probe. Never returns an error; failures are reported
    /// as `Unhealthy`.
    async fn health_check(&self) -> HealthReport;
}

/// Persisted cache tier that survives restarts.
#[async_trait]
pub trait DurableCache: Send + Sync {
    /// Fetch an entry. Expired entries may still be returned; the caller
    /// checks expiry.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, AppError>;

    /// Insert or replace an entry.
    async fn put(&self, entry: &CacheEntry) -> Result<(), AppError>;

    async fn invalidate(&self, key: &str) -> Result<(), AppError>;

    /// Physically remove expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, AppError>;
}

/// Sink for newly discovered listings, read back later as the local source.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Insert or refresh listings keyed by `(source, source_id)`.
    async fn upsert_listings(&self, listings: &[Listing]) -> Result<u64, AppError>;
}
