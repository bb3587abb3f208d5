use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, UpstreamErrorKind};

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Default page size when the caller does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 25;

/// How merged listings are ordered before pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Relevance,
    PriceAsc,
    PriceDesc,
    YearDesc,
    MileageAsc,
}

/// Normalized filter set for one logical search.
///
/// Pagination (`page`, `page_size`) is applied to the merged result and is
/// not part of the cache key, so one cached merge serves every page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub year_min: Option<u16>,
    #[serde(default)]
    pub year_max: Option<u16>,
    #[serde(default)]
    pub price_min: Option<u32>,
    #[serde(default)]
    pub price_max: Option<u32>,
    #[serde(default)]
    pub mileage_min: Option<u32>,
    #[serde(default)]
    pub mileage_max: Option<u32>,
    #[serde(default)]
    pub body_style: Option<String>,
    /// Free-text component, passed through to sources that accept it.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Explicit source allow-list. `None` means every enabled source.
    #[serde(default)]
    pub sources: Option<Vec<String>>,
    #[serde(default)]
    pub sort: Option<SortOrder>,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            make: None,
            model: None,
            year_min: None,
            year_max: None,
            price_min: None,
            price_max: None,
            mileage_min: None,
            mileage_max: None,
            body_style: None,
            query: None,
            page: default_page(),
            page_size: default_page_size(),
            sources: None,
            sort: None,
        }
    }
}

/// Canonical form used for hashing. Field order is fixed by the struct.
#[derive(Serialize)]
struct CacheKeyMaterial<'a> {
    make: Option<&'a str>,
    model: Option<&'a str>,
    year_min: Option<u16>,
    year_max: Option<u16>,
    price_min: Option<u32>,
    price_max: Option<u32>,
    mileage_min: Option<u32>,
    mileage_max: Option<u32>,
    body_style: Option<&'a str>,
    query: Option<&'a str>,
    sources: Option<&'a [String]>,
    sort: SortOrder,
}

impl SearchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_make(mut self, make: impl Into<String>) -> Self {
        self.make = Some(make.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_years(mut self, min: Option<u16>, max: Option<u16>) -> Self {
        self.year_min = min;
        self.year_max = max;
        self
    }

    pub fn with_price_range(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.price_min = min;
        self.price_max = max;
        self
    }

    pub fn with_mileage_range(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.mileage_min = min;
        self.mileage_max = max;
        self
    }

    pub fn with_body_style(mut self, body_style: impl Into<String>) -> Self {
        self.body_style = Some(body_style.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Check the request's own invariants.
    pub fn validate(&self) -> Result<(), AppError> {
        fn ordered<T: PartialOrd + fmt::Display>(
            name: &str,
            min: Option<T>,
            max: Option<T>,
        ) -> Result<(), AppError> {
            if let (Some(min), Some(max)) = (min, max)
                && min > max
            {
                return Err(AppError::InvalidRequest(format!(
                    "{name} range is inverted ({min} > {max})"
                )));
            }
            Ok(())
        }

        ordered("year", self.year_min, self.year_max)?;
        ordered("price", self.price_min, self.price_max)?;
        ordered("mileage", self.mileage_min, self.mileage_max)?;

        if self.page == 0 {
            return Err(AppError::InvalidRequest("page is 1-based".into()));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(AppError::InvalidRequest(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if let Some(sources) = &self.sources
            && sources.iter().any(|s| s.trim().is_empty())
        {
            return Err(AppError::InvalidRequest(
                "source allow-list contains an empty name".into(),
            ));
        }
        Ok(())
    }

    /// Return a copy with case-normalized strings and a sorted allow-list.
    pub fn normalized(&self) -> Self {
        let sources = self.sources.as_ref().map(|list| {
            let mut list: Vec<String> = list.iter().map(|s| normalize_text(s)).collect();
            list.sort();
            list.dedup();
            list
        });

        Self {
            make: normalize_opt(&self.make),
            model: normalize_opt(&self.model),
            body_style: normalize_opt(&self.body_style),
            query: normalize_opt(&self.query),
            sources,
            ..self.clone()
        }
    }

    /// The effective ordering for this request.
    pub fn effective_sort(&self) -> SortOrder {
        match self.sort {
            Some(sort) => sort,
            None if self.query.as_deref().is_some_and(|q| !q.trim().is_empty()) => {
                SortOrder::Relevance
            }
            None => SortOrder::PriceAsc,
        }
    }

    /// Stable SHA-256 key over the normalized filter set.
    ///
    /// Requests that differ only in string casing, surrounding whitespace,
    /// allow-list order or pagination hash identically.
    pub fn cache_key(&self) -> String {
        let normalized = self.normalized();
        let material = CacheKeyMaterial {
            make: normalized.make.as_deref(),
            model: normalized.model.as_deref(),
            year_min: normalized.year_min,
            year_max: normalized.year_max,
            price_min: normalized.price_min,
            price_max: normalized.price_max,
            mileage_min: normalized.mileage_min,
            mileage_max: normalized.mileage_max,
            body_style: normalized.body_style.as_deref(),
            query: normalized.query.as_deref(),
            sources: normalized.sources.as_deref(),
            sort: normalized.effective_sort(),
        };
        // Serializing a struct of plain values cannot fail.
        let canonical = serde_json::to_string(&material).unwrap_or_default();
        compute_hash(&canonical)
    }
}

/// Lowercase, trim and collapse inner whitespace.
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_opt(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(normalize_text)
        .filter(|s| !s.is_empty())
}

/// Canonical vehicle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub source: String,
    pub source_id: String,
    #[serde(default)]
    pub vin: Option<String>,
    pub title: String,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub price: Option<u32>,
    #[serde(default)]
    pub mileage: Option<u32>,
    #[serde(default)]
    pub body_style: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    #[serde(default)]
    pub detail_url: Option<String>,
    /// Timestamp reported by the source for this listing.
    #[serde(default)]
    pub listed_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn new(
        source: impl Into<String>,
        source_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
            vin: None,
            title: title.into(),
            make: None,
            model: None,
            year: None,
            price: None,
            mileage: None,
            body_style: None,
            location: None,
            media_urls: Vec::new(),
            detail_url: None,
            listed_at: None,
        }
    }

    /// Trimmed, uppercased VIN, or `None` when absent or blank.
    pub fn normalized_vin(&self) -> Option<String> {
        self.vin
            .as_deref()
            .map(|v| v.trim().to_uppercase())
            .filter(|v| !v.is_empty())
    }
}

/// Why a dispatched source failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimitedUpstream,
    ParseFailure,
    NotFound,
    PoolExhausted,
    Unknown,
}

impl FailureKind {
    pub fn from_error(error: &AppError) -> Self {
        match error {
            AppError::SourceTimeout { .. } => FailureKind::Timeout,
            AppError::SourceUpstream { kind, .. } => match kind {
                UpstreamErrorKind::Timeout => FailureKind::Timeout,
                UpstreamErrorKind::RateLimited => FailureKind::RateLimitedUpstream,
                UpstreamErrorKind::Parse => FailureKind::ParseFailure,
                UpstreamErrorKind::NotFound => FailureKind::NotFound,
                UpstreamErrorKind::Unknown => FailureKind::Unknown,
            },
            AppError::PoolExhausted(_) | AppError::PoolClosed => FailureKind::PoolExhausted,
            AppError::SerializationError(_) => FailureKind::ParseFailure,
            _ => FailureKind::Unknown,
        }
    }
}

/// A source that was dispatched and did not produce listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Why a candidate source was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen { retry_after_ms: u64 },
    RateLimited,
    DailyQuotaExceeded,
    Disabled,
    NotConfigured,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::CircuitOpen { retry_after_ms } => {
                write!(f, "circuit open (retry after {retry_after_ms} ms)")
            }
            SkipReason::RateLimited => write!(f, "rate limited"),
            SkipReason::DailyQuotaExceeded => write!(f, "daily quota exceeded"),
            SkipReason::Disabled => write!(f, "disabled"),
            SkipReason::NotConfigured => write!(f, "not configured"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedSource {
    pub source: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// Outcome of one aggregated search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    /// The requested page of merged, ranked listings.
    pub listings: Vec<Listing>,
    /// Number of merged listings before pagination.
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
    pub sources_succeeded: Vec<String>,
    pub sources_failed: Vec<SourceFailure>,
    pub sources_skipped: Vec<SkippedSource>,
    pub elapsed_ms: u64,
    /// True when any source failed or was skipped.
    pub partial: bool,
    pub cached: bool,
    pub cache_key: String,
    pub session_id: Uuid,
}

/// Merged payload stored in both cache tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAggregate {
    pub listings: Vec<Listing>,
    pub sources_succeeded: Vec<String>,
    pub sources_failed: Vec<SourceFailure>,
    pub sources_skipped: Vec<SkippedSource>,
}

/// Health classification reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(default)]
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency_ms: latency.as_millis() as u64,
            detail: None,
        }
    }

    pub fn with_status(status: HealthStatus, latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            status,
            latency_ms: latency.as_millis() as u64,
            detail: Some(detail.into()),
        }
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn cache_key_ignores_casing_whitespace_and_source_order() {
        let a = SearchRequest::new()
            .with_make("Toyota")
            .with_model("  Corolla ")
            .with_years(Some(2015), Some(2020))
            .with_sources(["dealer_api", "Auction"]);
        let b = SearchRequest::new()
            .with_sources(["auction", "DEALER_API"])
            .with_years(Some(2015), Some(2020))
            .with_model("corolla")
            .with_make("TOYOTA");

        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn cache_key_ignores_pagination() {
        let a = SearchRequest::new().with_make("ford").with_page(1, 25);
        let b = SearchRequest::new().with_make("ford").with_page(3, 50);
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn cache_key_differs_for_different_filters() {
        let a = SearchRequest::new().with_make("ford");
        let b = SearchRequest::new().with_make("ford").with_price_range(None, Some(20_000));
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn cache_key_treats_blank_strings_as_absent() {
        let a = SearchRequest::new().with_make("   ");
        let b = SearchRequest::new();
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn validate_rejects_inverted_ranges() {
        let req = SearchRequest::new().with_years(Some(2020), Some(2010));
        assert!(matches!(req.validate(), Err(AppError::InvalidRequest(_))));

        let req = SearchRequest::new().with_price_range(Some(30_000), Some(10_000));
        assert!(matches!(req.validate(), Err(AppError::InvalidRequest(_))));
    }

    #[test]
    fn validate_rejects_bad_pagination() {
        assert!(SearchRequest::new().with_page(0, 10).validate().is_err());
        assert!(SearchRequest::new().with_page(1, 0).validate().is_err());
        assert!(
            SearchRequest::new()
                .with_page(1, MAX_PAGE_SIZE + 1)
                .validate()
                .is_err()
        );
        assert!(SearchRequest::new().with_page(2, 50).validate().is_ok());
    }

    #[test]
    fn effective_sort_prefers_relevance_for_free_text() {
        assert_eq!(SearchRequest::new().effective_sort(), SortOrder::PriceAsc);
        assert_eq!(
            SearchRequest::new().with_query("red hatchback").effective_sort(),
            SortOrder::Relevance
        );
        assert_eq!(
            SearchRequest::new()
                .with_query("red hatchback")
                .with_sort(SortOrder::YearDesc)
                .effective_sort(),
            SortOrder::YearDesc
        );
    }

    #[test]
    fn deserializes_with_defaults() {
        let req: SearchRequest = serde_json::from_str(r#"{"make": "Honda"}"#).unwrap();
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, DEFAULT_PAGE_SIZE);
        assert!(req.sources.is_none());
    }

    #[test]
    fn normalized_vin_trims_and_uppercases() {
        let mut listing = Listing::new("a", "1", "Car");
        listing.vin = Some(" 1hgcm82633a004352 ".into());
        assert_eq!(listing.normalized_vin().as_deref(), Some("1HGCM82633A004352"));
        listing.vin = Some("  ".into());
        assert_eq!(listing.normalized_vin(), None);
    }

    #[test]
    fn skipped_source_serializes_flat() {
        let skipped = SkippedSource {
            source: "c".into(),
            reason: SkipReason::CircuitOpen {
                retry_after_ms: 1000,
            },
        };
        let json = serde_json::to_value(&skipped).unwrap();
        assert_eq!(json["source"], "c");
        assert_eq!(json["reason"], "circuit_open");
        assert_eq!(json["retry_after_ms"], 1000);
    }
}
