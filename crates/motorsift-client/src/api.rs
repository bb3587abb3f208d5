use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use motorsift_core::config::AdapterKind;
use motorsift_core::error::{AppError, UpstreamErrorKind};
use motorsift_core::models::{HealthReport, HealthStatus, Listing, SearchRequest};
use motorsift_core::traits::SourceAdapter;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

const USER_AGENT: &str = "motorsift/0.1 (listing aggregator)";

/// How to talk to one JSON search API. Lives in the `api` table of a source
/// definition; the engine never sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSourceSpec {
    pub base_url: String,
    #[serde(default = "default_search_path")]
    pub search_path: String,
    /// Probed by health checks. Defaults to a one-item search.
    #[serde(default)]
    pub health_path: Option<String>,
    /// Environment variable holding the API key, if the API needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    /// JSON pointer to the array of result items.
    #[serde(default = "default_items_pointer")]
    pub items_pointer: String,
    #[serde(default)]
    pub params: ParamNames,
    #[serde(default)]
    pub fields: FieldMap,
}

fn default_search_path() -> String {
    "/search".into()
}

fn default_api_key_header() -> String {
    "Authorization".into()
}

fn default_items_pointer() -> String {
    "/results".into()
}

/// Query parameter names the API expects for each filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamNames {
    pub make: String,
    pub model: String,
    pub year_min: String,
    pub year_max: String,
    pub price_min: String,
    pub price_max: String,
    pub mileage_min: String,
    pub mileage_max: String,
    pub body_style: String,
    pub query: String,
    pub page: String,
    pub page_size: String,
}

impl Default for ParamNames {
    fn default() -> Self {
        Self {
            make: "make".into(),
            model: "model".into(),
            year_min: "year_min".into(),
            year_max: "year_max".into(),
            price_min: "price_min".into(),
            price_max: "price_max".into(),
            mileage_min: "mileage_min".into(),
            mileage_max: "mileage_max".into(),
            body_style: "body_style".into(),
            query: "q".into(),
            page: "page".into(),
            page_size: "page_size".into(),
        }
    }
}

/// JSON pointers (relative to one result item) for each listing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub id: String,
    pub title: String,
    pub vin: String,
    pub make: String,
    pub model: String,
    pub year: String,
    pub price: String,
    pub mileage: String,
    pub body_style: String,
    pub location: String,
    pub detail_url: String,
    pub media: String,
    pub listed_at: String,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            id: "/id".into(),
            title: "/title".into(),
            vin: "/vin".into(),
            make: "/make".into(),
            model: "/model".into(),
            year: "/year".into(),
            price: "/price".into(),
            mileage: "/mileage".into(),
            body_style: "/body_style".into(),
            location: "/location".into(),
            detail_url: "/url".into(),
            media: "/photos".into(),
            listed_at: "/listed_at".into(),
        }
    }
}

/// Source adapter for JSON search APIs.
#[derive(Clone)]
pub struct HttpApiAdapter {
    id: String,
    spec: ApiSourceSpec,
    client: Client,
    search_url: Url,
    health_url: Option<Url>,
    api_key: Option<String>,
}

impl HttpApiAdapter {
    pub fn new(id: impl Into<String>, spec: ApiSourceSpec, timeout: Duration) -> Result<Self, AppError> {
        let id = id.into();
        let base = Url::parse(&spec.base_url)
            .map_err(|e| AppError::ConfigError(format!("source '{id}': invalid base_url: {e}")))?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| AppError::ConfigError(format!("source '{id}': invalid path '{path}': {e}")))
        };
        let search_url = join(&spec.search_path)?;
        let health_url = spec.health_path.as_deref().map(join).transpose()?;

        let api_key = match &spec.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                AppError::ConfigError(format!("source '{id}': environment variable {var} is not set"))
            })?),
            None => None,
        };

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            id,
            spec,
            client,
            search_url,
            health_url,
            api_key,
        })
    }

    /// Search URL with the request's filters encoded as query parameters.
    pub fn build_url(&self, request: &SearchRequest, page: u32, page_size: u32) -> Url {
        let names = &self.spec.params;
        let mut url = self.search_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            let mut put = |name: &str, value: Option<String>| {
                if let Some(value) = value
                    && !name.is_empty()
                {
                    pairs.append_pair(name, &value);
                }
            };
            put(&names.make, request.make.clone());
            put(&names.model, request.model.clone());
            put(&names.year_min, request.year_min.map(|v| v.to_string()));
            put(&names.year_max, request.year_max.map(|v| v.to_string()));
            put(&names.price_min, request.price_min.map(|v| v.to_string()));
            put(&names.price_max, request.price_max.map(|v| v.to_string()));
            put(&names.mileage_min, request.mileage_min.map(|v| v.to_string()));
            put(&names.mileage_max, request.mileage_max.map(|v| v.to_string()));
            put(&names.body_style, request.body_style.clone());
            put(&names.query, request.query.clone());
            put(&names.page, Some(page.to_string()));
            put(&names.page_size, Some(page_size.to_string()));
        }
        url
    }

    async fn get(&self, url: Url) -> Result<String, AppError> {
        let mut builder = self.client.get(url);
        if let Some(key) = &self.api_key {
            let value = if self.spec.api_key_header.eq_ignore_ascii_case("authorization") {
                format!("Bearer {key}")
            } else {
                key.clone()
            };
            builder = builder.header(self.spec.api_key_header.as_str(), value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::upstream(&self.id, UpstreamErrorKind::Timeout, e.to_string())
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection to {} failed: {e}", self.id))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.id, status, &body));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))
    }
}

#[async_trait]
impl SourceAdapter for HttpApiAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Api
    }

    async fn search(
        &self,
        request: &SearchRequest,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Listing>, AppError> {
        let url = self.build_url(request, page, page_size);
        tracing::debug!(source = %self.id, url = %url, "Querying API source");

        let body = self.get(url).await?;
        let listings = parse_listings(&self.id, &body, &self.spec)?;
        tracing::debug!(source = %self.id, count = listings.len(), "API source answered");
        Ok(listings)
    }

    async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let url = match &self.health_url {
            Some(url) => url.clone(),
            None => self.build_url(&SearchRequest::new(), 1, 1),
        };

        match self.get(url).await {
            Ok(_) => HealthReport::healthy(started.elapsed()),
            Err(e) if e.is_upstream_rate_limit() => {
                HealthReport::with_status(HealthStatus::Degraded, started.elapsed(), e.to_string())
            }
            Err(e) => HealthReport::with_status(HealthStatus::Unhealthy, started.elapsed(), e.to_string()),
        }
    }
}

/// Map a non-success HTTP status to the upstream error taxonomy.
pub fn classify_status(source_id: &str, status: StatusCode, body: &str) -> AppError {
    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => UpstreamErrorKind::RateLimited,
        StatusCode::NOT_FOUND => UpstreamErrorKind::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => UpstreamErrorKind::Timeout,
        _ => UpstreamErrorKind::Unknown,
    };
    let snippet: String = body.chars().take(200).collect();
    AppError::upstream(source_id, kind, format!("HTTP {}: {snippet}", status.as_u16()))
}

/// Parse an API response body into listings.
///
/// Items without an id are dropped; a missing title is rebuilt from
/// year, make and model.
pub fn parse_listings(source_id: &str, body: &str, spec: &ApiSourceSpec) -> Result<Vec<Listing>, AppError> {
    let parse_error = |message: String| AppError::upstream(source_id, UpstreamErrorKind::Parse, message);

    let document: Value =
        serde_json::from_str(body).map_err(|e| parse_error(format!("invalid JSON: {e}")))?;
    let items = document
        .pointer(&spec.items_pointer)
        .and_then(Value::as_array)
        .ok_or_else(|| parse_error(format!("no result array at '{}'", spec.items_pointer)))?;

    let mut listings = Vec::with_capacity(items.len());
    let mut dropped = 0usize;
    for item in items {
        match map_item(source_id, item, &spec.fields) {
            Some(listing) => listings.push(listing),
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        tracing::debug!(source = %source_id, dropped, "Dropped result items without an id");
    }
    Ok(listings)
}

fn map_item(source_id: &str, item: &Value, fields: &FieldMap) -> Option<Listing> {
    let id = text(item, &fields.id)?;

    let make = text(item, &fields.make);
    let model = text(item, &fields.model);
    let year = number(item, &fields.year).and_then(|v| u16::try_from(v).ok());

    let title = text(item, &fields.title).unwrap_or_else(|| {
        [year.map(|y| y.to_string()), make.clone(), model.clone()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    });

    let mut listing = Listing::new(source_id, id, title);
    listing.vin = text(item, &fields.vin);
    listing.make = make;
    listing.model = model;
    listing.year = year;
    listing.price = number(item, &fields.price).and_then(|v| u32::try_from(v).ok());
    listing.mileage = number(item, &fields.mileage).and_then(|v| u32::try_from(v).ok());
    listing.body_style = text(item, &fields.body_style);
    listing.location = text(item, &fields.location);
    listing.detail_url = text(item, &fields.detail_url);
    listing.media_urls = match item.pointer(&fields.media) {
        Some(Value::Array(urls)) => urls.iter().filter_map(|u| u.as_str().map(String::from)).collect(),
        Some(Value::String(url)) => vec![url.clone()],
        _ => Vec::new(),
    };
    listing.listed_at = text(item, &fields.listed_at)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Some(listing)
}

fn text(item: &Value, pointer: &str) -> Option<String> {
    match item.pointer(pointer)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts JSON numbers and formatted strings such as "$12,500" or "48,000 mi".
fn number(item: &Value, pointer: &str) -> Option<u64> {
    match item.pointer(pointer)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

pub(crate) fn parse_number(raw: &str) -> Option<u64> {
    let integral = raw.split('.').next().unwrap_or(raw);
    let digits: String = integral.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}
