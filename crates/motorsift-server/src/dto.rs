use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use motorsift_core::config::AdapterKind;
use motorsift_core::models::{
    AggregationResult, FailureKind, Listing, SearchRequest, SkipReason, SkippedSource, SortOrder,
    SourceFailure,
};
use motorsift_core::scheduler::{SourceHealth, SourceStats};

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortParam {
    Relevance,
    PriceAsc,
    PriceDesc,
    YearDesc,
    MileageAsc,
}

impl From<SortParam> for SortOrder {
    fn from(sort: SortParam) -> Self {
        match sort {
            SortParam::Relevance => SortOrder::Relevance,
            SortParam::PriceAsc => SortOrder::PriceAsc,
            SortParam::PriceDesc => SortOrder::PriceDesc,
            SortParam::YearDesc => SortOrder::YearDesc,
            SortParam::MileageAsc => SortOrder::MileageAsc,
        }
    }
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct SearchBody {
    pub make: Option<String>,
    pub model: Option<String>,
    pub year_min: Option<u16>,
    pub year_max: Option<u16>,
    pub price_min: Option<u32>,
    pub price_max: Option<u32>,
    pub mileage_min: Option<u32>,
    pub mileage_max: Option<u32>,
    pub body_style: Option<String>,
    /// Free text, passed through to sources that accept it
    pub query: Option<String>,
    /// 1-based page of the merged result (default 1)
    pub page: Option<u32>,
    /// Listings per page (default 25)
    pub page_size: Option<u32>,
    /// Restrict the search to these source ids
    pub sources: Option<Vec<String>>,
    pub sort: Option<SortParam>,
    /// Client-chosen id, so progress can be subscribed to before the search starts.
    /// Must not be in use by another running search.
    pub session_id: Option<Uuid>,
}

impl SearchBody {
    pub fn to_request(&self) -> SearchRequest {
        let defaults = SearchRequest::default();
        SearchRequest {
            make: self.make.clone(),
            model: self.model.clone(),
            year_min: self.year_min,
            year_max: self.year_max,
            price_min: self.price_min,
            price_max: self.price_max,
            mileage_min: self.mileage_min,
            mileage_max: self.mileage_max,
            body_style: self.body_style.clone(),
            query: self.query.clone(),
            page: self.page.unwrap_or(defaults.page),
            page_size: self.page_size.unwrap_or(defaults.page_size),
            sources: self.sources.clone(),
            sort: self.sort.map(Into::into),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ListingResponse {
    pub source: String,
    pub source_id: String,
    pub vin: Option<String>,
    pub title: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year: Option<u16>,
    pub price: Option<u32>,
    pub mileage: Option<u32>,
    pub body_style: Option<String>,
    pub location: Option<String>,
    pub media_urls: Vec<String>,
    pub detail_url: Option<String>,
    pub listed_at: Option<DateTime<Utc>>,
}

impl From<Listing> for ListingResponse {
    fn from(l: Listing) -> Self {
        Self {
            source: l.source,
            source_id: l.source_id,
            vin: l.vin,
            title: l.title,
            make: l.make,
            model: l.model,
            year: l.year,
            price: l.price,
            mileage: l.mileage,
            body_style: l.body_style,
            location: l.location,
            media_urls: l.media_urls,
            detail_url: l.detail_url,
            listed_at: l.listed_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceFailureResponse {
    pub source: String,
    /// timeout, rate_limited_upstream, parse_failure, not_found, pool_exhausted or unknown
    pub kind: &'static str,
    pub message: String,
}

fn failure_kind(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Timeout => "timeout",
        FailureKind::RateLimitedUpstream => "rate_limited_upstream",
        FailureKind::ParseFailure => "parse_failure",
        FailureKind::NotFound => "not_found",
        FailureKind::PoolExhausted => "pool_exhausted",
        FailureKind::Unknown => "unknown",
    }
}

impl From<SourceFailure> for SourceFailureResponse {
    fn from(f: SourceFailure) -> Self {
        Self {
            source: f.source,
            kind: failure_kind(f.kind),
            message: f.message,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SkippedSourceResponse {
    pub source: String,
    /// circuit_open, rate_limited, daily_quota_exceeded, disabled or not_configured
    pub reason: &'static str,
    pub retry_after_ms: Option<u64>,
}

impl From<SkippedSource> for SkippedSourceResponse {
    fn from(s: SkippedSource) -> Self {
        let (reason, retry_after_ms) = match s.reason {
            SkipReason::CircuitOpen { retry_after_ms } => ("circuit_open", Some(retry_after_ms)),
            SkipReason::RateLimited => ("rate_limited", None),
            SkipReason::DailyQuotaExceeded => ("daily_quota_exceeded", None),
            SkipReason::Disabled => ("disabled", None),
            SkipReason::NotConfigured => ("not_configured", None),
        };
        Self {
            source: s.source,
            reason,
            retry_after_ms,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SearchResponse {
    pub session_id: Uuid,
    pub listings: Vec<ListingResponse>,
    /// Merged listings across all pages
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
    pub sources_succeeded: Vec<String>,
    pub sources_failed: Vec<SourceFailureResponse>,
    pub sources_skipped: Vec<SkippedSourceResponse>,
    pub elapsed_ms: u64,
    /// Some sources failed or were skipped; results may be incomplete
    pub partial: bool,
    pub cached: bool,
}

impl From<AggregationResult> for SearchResponse {
    fn from(r: AggregationResult) -> Self {
        Self {
            session_id: r.session_id,
            listings: r.listings.into_iter().map(ListingResponse::from).collect(),
            total: r.total,
            page: r.page,
            page_size: r.page_size,
            sources_succeeded: r.sources_succeeded,
            sources_failed: r.sources_failed.into_iter().map(Into::into).collect(),
            sources_skipped: r.sources_skipped.into_iter().map(Into::into).collect(),
            elapsed_ms: r.elapsed_ms,
            partial: r.partial,
            cached: r.cached,
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CircuitResponse {
    /// closed, open or half-open
    pub state: String,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open_ms: Option<u64>,
    pub total_successes: u64,
    pub total_failures: u64,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceResponse {
    pub id: String,
    /// api or automation
    pub kind: &'static str,
    pub enabled: bool,
    pub timeout_ms: u64,
    pub max_results: u32,
    pub daily_quota: Option<u64>,
    pub daily_used: u64,
    pub circuit: CircuitResponse,
    pub fetches: u64,
    pub average_fetch_ms: Option<u64>,
}

impl From<SourceStats> for SourceResponse {
    fn from(s: SourceStats) -> Self {
        Self {
            kind: match s.config.kind {
                AdapterKind::Api => "api",
                AdapterKind::Automation => "automation",
            },
            id: s.config.id,
            enabled: s.config.enabled,
            timeout_ms: s.config.timeout_ms,
            max_results: s.config.max_results,
            daily_quota: s.config.daily_quota,
            daily_used: s.usage.map(|u| u.daily_used).unwrap_or(0),
            circuit: CircuitResponse {
                state: s.circuit.state.to_string(),
                failure_count: s.circuit.failure_count,
                last_error: s.circuit.last_error,
                time_until_half_open_ms: s.circuit.time_until_half_open_ms,
                total_successes: s.circuit.total_successes,
                total_failures: s.circuit.total_failures,
            },
            fetches: s.fetch_cost.map(|c| c.fetches).unwrap_or(0),
            average_fetch_ms: s.fetch_cost.filter(|c| c.fetches > 0).map(|c| c.average_ms()),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceHealthResponse {
    pub source: String,
    pub enabled: bool,
    pub circuit: String,
    /// healthy, degraded or unhealthy
    pub status: String,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

impl From<SourceHealth> for SourceHealthResponse {
    fn from(h: SourceHealth) -> Self {
        Self {
            source: h.source,
            enabled: h.enabled,
            circuit: h.circuit.to_string(),
            status: format!("{:?}", h.report.status).to_lowercase(),
            latency_ms: h.report.latency_ms,
            detail: h.report.detail,
        }
    }
}

#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
pub struct SourceListQuery {
    /// Run a live health check against every source
    pub health: Option<bool>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceListResponse {
    pub sources: Vec<SourceResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<Vec<SourceHealthResponse>>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct UpdateSourceRequest {
    pub enabled: bool,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub sources: usize,
    pub enabled_sources: usize,
    pub open_circuits: usize,
    /// ok, error or disabled
    pub database: &'static str,
    pub active_sessions: usize,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
