//! The set of configured sources, built once at startup and shared by handle.
//!
//! Each entry pairs a mutable [`SourceConfig`] with its adapter and its own
//! circuit breaker. The registry also owns the rate limiter, so per-source
//! state lives in one place and is never a process-wide global.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{CircuitBreakerConfig, SourceConfig};
use crate::error::AppError;
use crate::rate_limiter::{RateLimiter, SEARCH_OP};
use crate::traits::SourceAdapter;

pub struct SourceEntry {
    id: String,
    config: RwLock<SourceConfig>,
    adapter: Arc<dyn SourceAdapter>,
    breaker: CircuitBreaker,
}

impl SourceEntry {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Copy of the current configuration.
    pub fn config(&self) -> SourceConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| {
                tracing::warn!(source = %self.id, "Recovered from poisoned source config lock");
                poisoned.into_inner()
            })
            .clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.config().enabled
    }

    pub fn adapter(&self) -> &Arc<dyn SourceAdapter> {
        &self.adapter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn set_enabled(&self, enabled: bool) -> SourceConfig {
        let mut config = self.config.write().unwrap_or_else(|poisoned| {
            tracing::warn!(source = %self.id, "Recovered from poisoned source config lock");
            poisoned.into_inner()
        });
        config.enabled = enabled;
        config.clone()
    }
}

impl std::fmt::Debug for SourceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceEntry")
            .field("id", &self.id)
            .field("config", &self.config())
            .finish()
    }
}

pub struct SourceRegistry {
    sources: RwLock<BTreeMap<String, Arc<SourceEntry>>>,
    limiter: RateLimiter,
    circuit: CircuitBreakerConfig,
}

impl SourceRegistry {
    pub fn new(circuit: CircuitBreakerConfig) -> Self {
        Self::with_limiter(circuit, RateLimiter::new())
    }

    pub fn with_limiter(circuit: CircuitBreakerConfig, limiter: RateLimiter) -> Self {
        Self {
            sources: RwLock::new(BTreeMap::new()),
            limiter,
            circuit,
        }
    }

    /// Add a source. Its id must match the adapter's and be unique.
    pub fn register(
        &self,
        config: SourceConfig,
        adapter: Arc<dyn SourceAdapter>,
    ) -> Result<(), AppError> {
        config.validate()?;
        if config.kind != adapter.kind() {
            return Err(AppError::ConfigError(format!(
                "source '{}' is configured as {:?} but its adapter is {:?}",
                config.id,
                config.kind,
                adapter.kind()
            )));
        }
        if config.id != adapter.id() {
            return Err(AppError::ConfigError(format!(
                "source '{}' is backed by adapter '{}'",
                config.id,
                adapter.id()
            )));
        }

        let mut sources = self.write_sources();
        if sources.contains_key(&config.id) {
            return Err(AppError::ConfigError(format!(
                "source '{}' is registered twice",
                config.id
            )));
        }

        if config.rate_limit.is_some() || config.daily_quota.is_some() {
            self.limiter
                .configure(&config.id, SEARCH_OP, config.rate_limit, config.daily_quota)?;
        }

        tracing::info!(
            source = %config.id,
            kind = ?config.kind,
            enabled = config.enabled,
            "Registered source"
        );
        let entry = SourceEntry {
            id: config.id.clone(),
            breaker: CircuitBreaker::new(config.id.clone(), self.circuit.clone()),
            config: RwLock::new(config),
            adapter,
        };
        sources.insert(entry.id.clone(), Arc::new(entry));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<SourceEntry>> {
        self.read_sources().get(id).cloned()
    }

    /// All sources in id order.
    pub fn entries(&self) -> Vec<Arc<SourceEntry>> {
        self.read_sources().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read_sources().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_sources().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_sources().is_empty()
    }

    /// Enable or disable a source at runtime. Returns the updated config.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Option<SourceConfig> {
        let entry = self.get(id)?;
        let config = entry.set_enabled(enabled);
        tracing::info!(source = %id, enabled, "Source toggled");
        Some(config)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn read_sources(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<SourceEntry>>> {
        self.sources.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned source registry lock");
            poisoned.into_inner()
        })
    }

    fn write_sources(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<SourceEntry>>> {
        self.sources.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned source registry lock");
            poisoned.into_inner()
        })
    }
}
