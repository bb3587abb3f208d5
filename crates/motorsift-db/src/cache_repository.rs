use async_trait::async_trait;
use chrono::{DateTime, Utc};
use motorsift_core::cache::{CacheEntry, TtlClass};
use motorsift_core::error::AppError;
use motorsift_core::models::CachedAggregate;
use motorsift_core::traits::DurableCache;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};

/// PostgreSQL durable cache tier, keyed by the request hash.
#[derive(Clone)]
pub struct CacheRepository {
    pool: Pool<Postgres>,
}

impl CacheRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of stored entries, expired or not.
    pub async fn count(&self) -> Result<i64, AppError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM search_cache")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(row.0)
    }
}

#[derive(sqlx::FromRow)]
struct CacheRow {
    cache_key: String,
    payload: Json<CachedAggregate>,
    ttl_class: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<CacheRow> for CacheEntry {
    fn from(row: CacheRow) -> Self {
        CacheEntry {
            key: row.cache_key,
            payload: row.payload.0,
            created_at: row.created_at,
            expires_at: row.expires_at,
            ttl_class: parse_ttl_class(&row.ttl_class),
        }
    }
}

fn parse_ttl_class(raw: &str) -> TtlClass {
    match raw {
        "hot" => TtlClass::Hot,
        _ => TtlClass::Warm,
    }
}

#[async_trait]
impl DurableCache for CacheRepository {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, AppError> {
        let row = sqlx::query_as::<_, CacheRow>(
            r#"
            SELECT cache_key, payload, ttl_class, created_at, expires_at
            FROM search_cache
            WHERE cache_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO search_cache (cache_key, payload, ttl_class, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (cache_key) DO UPDATE
            SET payload = EXCLUDED.payload,
                ttl_class = EXCLUDED.ttl_class,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&entry.key)
        .bind(Json(&entry.payload))
        .bind(entry.ttl_class.as_str())
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM search_cache WHERE cache_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM search_cache WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
