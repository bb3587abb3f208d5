use std::time::Duration;

use motorsift_core::AppError;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Connection settings for the durable cache and the listing store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }

    /// Read configuration from environment variables.
    ///
    /// - `DATABASE_URL` (required)
    /// - `DATABASE_MAX_CONNECTIONS` (optional, defaults to 5)
    /// - `DATABASE_ACQUIRE_TIMEOUT_SECS` (optional, defaults to 5)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), or `None` when `DATABASE_URL` is
    /// unset. The engine runs without a durable tier in that case.
    pub fn from_env_optional() -> Result<Option<Self>, AppError> {
        if std::env::var("DATABASE_URL").is_err() {
            return Ok(None);
        }
        Self::from_env().map(Some)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let url = lookup("DATABASE_URL").ok_or_else(|| {
            AppError::ConfigError("DATABASE_URL not set. Required for database operations.".into())
        })?;
        let mut config = Self::new(url);

        if let Some(raw) = lookup("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = positive(&raw, "DATABASE_MAX_CONNECTIONS")? as u32;
        }
        if let Some(raw) = lookup("DATABASE_ACQUIRE_TIMEOUT_SECS") {
            config.acquire_timeout = Duration::from_secs(positive(&raw, "DATABASE_ACQUIRE_TIMEOUT_SECS")?);
        }
        Ok(config)
    }
}

fn positive(raw: &str, name: &str) -> Result<u64, AppError> {
    match raw.trim().parse::<u32>() {
        Ok(0) => Err(AppError::ConfigError(format!("{name} must be at least 1"))),
        Ok(value) => Ok(u64::from(value)),
        Err(_) => Err(AppError::ConfigError(format!(
            "Invalid {name} '{raw}': must be a positive integer"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn reads_url_and_defaults() {
        let config = DatabaseConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://db/motorsift")])).unwrap();
        assert_eq!(config.url, "postgres://db/motorsift");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn url_is_required() {
        assert!(matches!(
            DatabaseConfig::from_lookup(lookup(&[])),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn rejects_zero_and_garbage() {
        for bad in ["0", "many", "-3"] {
            let result = DatabaseConfig::from_lookup(lookup(&[
                ("DATABASE_URL", "postgres://db/motorsift"),
                ("DATABASE_MAX_CONNECTIONS", bad),
            ]));
            assert!(result.is_err(), "accepted {bad}");
        }
    }
}
