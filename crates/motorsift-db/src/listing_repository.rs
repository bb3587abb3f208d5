use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use motorsift_core::config::AdapterKind;
use motorsift_core::error::AppError;
use motorsift_core::models::{HealthReport, HealthStatus, Listing, SearchRequest};
use motorsift_core::traits::{ListingStore, SourceAdapter};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres, QueryBuilder};

const DEFAULT_SOURCE_ID: &str = "local";

/// Listings persisted from live sources.
///
/// As a [`ListingStore`] it receives write-back; as a [`SourceAdapter`] it is
/// the "local" pre-fetched source. Listings it serves carry
/// `<origin>:<origin id>` as their source id so records from different
/// origins never collide.
#[derive(Clone)]
pub struct ListingRepository {
    pool: Pool<Postgres>,
    source_id: String,
    max_age: Option<Duration>,
}

impl ListingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            source_id: DEFAULT_SOURCE_ID.to_string(),
            max_age: None,
        }
    }

    pub fn with_source_id(mut self, id: impl Into<String>) -> Self {
        self.source_id = id.into();
        self
    }

    /// Only serve listings seen within `max_age`.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub async fn count(&self) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.0)
    }

    /// Delete listings not seen for `age`. Returns how many were removed.
    pub async fn purge_older_than(&self, age: Duration) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM listings WHERE last_seen_at < NOW() - $1")
            .bind(to_interval(age))
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(result.rows_affected())
    }

    fn build_search<'a>(&self, request: &'a SearchRequest, page: u32, page_size: u32) -> QueryBuilder<'a, Postgres> {
        let mut qb = QueryBuilder::new(
            "SELECT source, source_id, vin, title, make, model, year, price, mileage, \
             body_style, location, media_urls, detail_url, listed_at FROM listings WHERE TRUE",
        );

        if let Some(make) = &request.make {
            qb.push(" AND LOWER(make) = LOWER(").push_bind(make.trim()).push(")");
        }
        if let Some(model) = &request.model {
            qb.push(" AND LOWER(model) = LOWER(").push_bind(model.trim()).push(")");
        }
        if let Some(body_style) = &request.body_style {
            qb.push(" AND LOWER(body_style) = LOWER(").push_bind(body_style.trim()).push(")");
        }
        if let Some(min) = request.year_min {
            qb.push(" AND year >= ").push_bind(i32::from(min));
        }
        if let Some(max) = request.year_max {
            qb.push(" AND year <= ").push_bind(i32::from(max));
        }
        if let Some(min) = request.price_min {
            qb.push(" AND price >= ").push_bind(saturating_i32(min));
        }
        if let Some(max) = request.price_max {
            qb.push(" AND price <= ").push_bind(saturating_i32(max));
        }
        if let Some(min) = request.mileage_min {
            qb.push(" AND mileage >= ").push_bind(saturating_i32(min));
        }
        if let Some(max) = request.mileage_max {
            qb.push(" AND mileage <= ").push_bind(saturating_i32(max));
        }
        if let Some(query) = &request.query {
            for token in query.split_whitespace() {
                qb.push(" AND title ILIKE ").push_bind(format!("%{}%", escape_like(token)));
            }
        }
        if let Some(max_age) = self.max_age {
            qb.push(" AND last_seen_at >= NOW() - ").push_bind(to_interval(max_age));
        }

        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);
        qb.push(" ORDER BY last_seen_at DESC, source, source_id LIMIT ")
            .push_bind(i64::from(page_size))
            .push(" OFFSET ")
            .push_bind(offset);
        qb
    }
}

#[derive(sqlx::FromRow)]
struct ListingRow {
    source: String,
    source_id: String,
    vin: Option<String>,
    title: String,
    make: Option<String>,
    model: Option<String>,
    year: Option<i32>,
    price: Option<i32>,
    mileage: Option<i32>,
    body_style: Option<String>,
    location: Option<String>,
    media_urls: Json<Vec<String>>,
    detail_url: Option<String>,
    listed_at: Option<DateTime<Utc>>,
}

impl ListingRow {
    fn into_listing(self, local_id: &str) -> Listing {
        let mut listing = Listing::new(local_id, format!("{}:{}", self.source, self.source_id), self.title);
        listing.vin = self.vin;
        listing.make = self.make;
        listing.model = self.model;
        listing.year = self.year.and_then(|v| u16::try_from(v).ok());
        listing.price = self.price.and_then(|v| u32::try_from(v).ok());
        listing.mileage = self.mileage.and_then(|v| u32::try_from(v).ok());
        listing.body_style = self.body_style;
        listing.location = self.location;
        listing.media_urls = self.media_urls.0;
        listing.detail_url = self.detail_url;
        listing.listed_at = self.listed_at;
        listing
    }
}

#[async_trait]
impl SourceAdapter for ListingRepository {
    fn id(&self) -> &str {
        &self.source_id
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
        let rows = self
            .build_search(request, page, page_size)
            .build_query_as::<ListingRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(|row| row.into_listing(&self.source_id)).collect())
    }

    async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => HealthReport::healthy(started.elapsed()),
            Err(e) => HealthReport::with_status(HealthStatus::Unhealthy, started.elapsed(), e.to_string()),
        }
    }
}

#[async_trait]
impl ListingStore for ListingRepository {
    async fn upsert_listings(&self, listings: &[Listing]) -> Result<u64, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut written = 0;
        for listing in listings {
            let result = sqlx::query(
                r#"
                INSERT INTO listings (source, source_id, vin, title, make, model, year, price,
                                      mileage, body_style, location, media_urls, detail_url, listed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (source, source_id) DO UPDATE
                SET vin = EXCLUDED.vin,
                    title = EXCLUDED.title,
                    make = EXCLUDED.make,
                    model = EXCLUDED.model,
                    year = EXCLUDED.year,
                    price = EXCLUDED.price,
                    mileage = EXCLUDED.mileage,
                    body_style = EXCLUDED.body_style,
                    location = EXCLUDED.location,
                    media_urls = EXCLUDED.media_urls,
                    detail_url = EXCLUDED.detail_url,
                    listed_at = COALESCE(EXCLUDED.listed_at, listings.listed_at),
                    last_seen_at = NOW()
                "#,
            )
            .bind(&listing.source)
            .bind(&listing.source_id)
            .bind(listing.normalized_vin())
            .bind(&listing.title)
            .bind(&listing.make)
            .bind(&listing.model)
            .bind(listing.year.map(i32::from))
            .bind(listing.price.map(saturating_i32))
            .bind(listing.mileage.map(saturating_i32))
            .bind(&listing.body_style)
            .bind(&listing.location)
            .bind(Json(&listing.media_urls))
            .bind(&listing.detail_url)
            .bind(listing.listed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            written += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(written)
    }
}

fn saturating_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_interval(age: Duration) -> sqlx::postgres::types::PgInterval {
    sqlx::postgres::types::PgInterval {
        months: 0,
        days: 0,
        microseconds: i64::try_from(age.as_micros()).unwrap_or(i64::MAX),
    }
}

/// Escape `%`, `_` and `\` for use inside an ILIKE pattern.
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
