//! TOML source definitions.
//!
//! ```toml
//! [engine.scheduler]
//! overall_timeout_ms = 12000
//!
//! [[sources]]
//! id = "dealer_api"
//! kind = "api"
//! timeout_ms = 4000
//! rate_limit = { rate = 10, period_ms = 1000 }
//!
//! [sources.api]
//! base_url = "https://dealer.example"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use motorsift_core::config::{AdapterKind, EngineConfig, PoolConfig, SourceConfig};
use motorsift_core::error::AppError;
use serde::{Deserialize, Serialize};

use crate::api::ApiSourceSpec;
use crate::scrape::ScrapeSpec;

const DEFAULT_CONFIG_PATH: &str = "motorsift.toml";

/// One `[[sources]]` entry: engine-visible settings plus adapter-local tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDefinition {
    #[serde(flatten)]
    pub config: SourceConfig,
    #[serde(default)]
    pub api: Option<ApiSourceSpec>,
    #[serde(default)]
    pub scrape: Option<ScrapeSpec>,
    /// Overrides the engine-wide pool settings for automation sources.
    #[serde(default)]
    pub pool: Option<PoolConfig>,
}

impl SourceDefinition {
    pub fn validate(&self) -> Result<(), AppError> {
        self.config.validate()?;
        let id = &self.config.id;
        match self.config.kind {
            AdapterKind::Api if self.api.is_none() => Err(AppError::ConfigError(format!(
                "source '{id}' is kind 'api' but has no [sources.api] table"
            ))),
            AdapterKind::Automation if self.scrape.is_none() => Err(AppError::ConfigError(format!(
                "source '{id}' is kind 'automation' but has no [sources.scrape] table"
            ))),
            _ => Ok(()),
        }
    }
}

/// Whole configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, AppError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| AppError::ConfigError(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Cannot read configuration {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(path = %path.display(), sources = config.sources.len(), "Loaded configuration");
        Ok(config)
    }

    /// Load the file named by `MOTORSIFT_CONFIG` (default `motorsift.toml`)
    /// and apply engine environment overrides.
    pub fn from_env() -> Result<Self, AppError> {
        let path = std::env::var("MOTORSIFT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load(&path)?.with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self, AppError> {
        self.engine = self.engine.with_env_overrides()?;
        self.engine.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.engine.validate()?;
        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.config.id.as_str()) {
                return Err(AppError::ConfigError(format!(
                    "source '{}' is defined twice",
                    source.config.id
                )));
            }
        }
        Ok(())
    }
}
