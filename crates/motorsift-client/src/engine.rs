//! Assembles an [`Aggregator`] from an [`AppConfig`]. Shared by the CLI and
//! the server.

use std::sync::Arc;

use motorsift_core::cache::ResultCache;
use motorsift_core::config::{AdapterKind, SourceConfig};
use motorsift_core::error::AppError;
use motorsift_core::registry::SourceRegistry;
use motorsift_core::scheduler::Aggregator;
use motorsift_core::traits::{DurableCache, ListingStore, SourceAdapter};

use crate::api::HttpApiAdapter;
use crate::definition::{AppConfig, SourceDefinition};

#[cfg(feature = "browser")]
use crate::browser::{BrowserSessionManager, ScrapedSource, launch_browser};
#[cfg(feature = "browser")]
use motorsift_core::automation::AutomationAdapter;
#[cfg(feature = "browser")]
use motorsift_core::pool::ResourcePool;

/// A built engine plus the resources that need an orderly shutdown.
pub struct Engine {
    aggregator: Arc<Aggregator>,
    #[cfg(feature = "browser")]
    pools: Vec<ResourcePool<BrowserSessionManager>>,
}

impl Engine {
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Close pooled browser sessions. Idempotent.
    pub async fn shutdown(&self) {
        #[cfg(feature = "browser")]
        for pool in &self.pools {
            pool.shutdown().await;
        }
        tracing::info!("Engine shut down");
    }
}

pub struct EngineBuilder {
    config: AppConfig,
    durable: Option<Arc<dyn DurableCache>>,
    store: Option<Arc<dyn ListingStore>>,
    extra: Vec<(SourceConfig, Arc<dyn SourceAdapter>)>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            durable: None,
            store: None,
            extra: Vec::new(),
        }
    }

    pub fn with_durable_cache(mut self, durable: Arc<dyn DurableCache>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_listing_store(mut self, store: Arc<dyn ListingStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register an adapter that is not described by the configuration file,
    /// such as the local listing store.
    pub fn with_source(mut self, config: SourceConfig, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.extra.push((config, adapter));
        self
    }

    pub async fn build(self) -> Result<Engine, AppError> {
        self.config.validate()?;
        let engine_config = &self.config.engine;
        let registry = Arc::new(SourceRegistry::new(engine_config.circuit.clone()));

        #[cfg(feature = "browser")]
        let mut pools = Vec::new();
        #[cfg(feature = "browser")]
        let mut browser = None;

        for definition in &self.config.sources {
            match definition.config.kind {
                AdapterKind::Api => {
                    let adapter = build_api_adapter(definition)?;
                    registry.register(definition.config.clone(), Arc::new(adapter))?;
                }
                #[cfg(feature = "browser")]
                AdapterKind::Automation => {
                    let browser = match &browser {
                        Some(browser) => Arc::clone(browser),
                        None => {
                            let launched = launch_browser().await?;
                            browser = Some(Arc::clone(&launched));
                            launched
                        }
                    };
                    let pool_config = definition
                        .pool
                        .clone()
                        .unwrap_or_else(|| engine_config.pool.clone());
                    let pool = ResourcePool::new(
                        definition.config.id.clone(),
                        BrowserSessionManager::new(browser),
                        pool_config,
                    );
                    pool.start().await?;

                    let spec = definition.scrape.clone().ok_or_else(|| missing_table(definition))?;
                    let script = ScrapedSource::new(definition.config.id.clone(), spec, definition.config.timeout())?;
                    let adapter = AutomationAdapter::new(definition.config.id.clone(), pool.clone(), script);
                    registry.register(definition.config.clone(), Arc::new(adapter))?;
                    pools.push(pool);
                }
                #[cfg(not(feature = "browser"))]
                AdapterKind::Automation => {
                    tracing::warn!(
                        source = %definition.config.id,
                        "Built without the `browser` feature, skipping automation source"
                    );
                }
            }
        }

        for (config, adapter) in self.extra {
            registry.register(config, adapter)?;
        }

        let mut cache = ResultCache::new(engine_config.cache.clone());
        if let Some(durable) = self.durable {
            cache = cache.with_durable(durable);
        }

        let mut aggregator = Aggregator::new(registry, Arc::new(cache), engine_config.scheduler.clone());
        if let Some(store) = self.store {
            aggregator = aggregator.with_listing_store(store);
        }

        tracing::info!(
            sources = aggregator.registry().len(),
            durable_cache = aggregator.cache().has_durable_tier(),
            "Engine ready"
        );

        Ok(Engine {
            aggregator: Arc::new(aggregator),
            #[cfg(feature = "browser")]
            pools,
        })
    }
}

fn build_api_adapter(definition: &SourceDefinition) -> Result<HttpApiAdapter, AppError> {
    let spec = definition.api.clone().ok_or_else(|| missing_table(definition))?;
    HttpApiAdapter::new(definition.config.id.clone(), spec, definition.config.timeout())
}

fn missing_table(definition: &SourceDefinition) -> AppError {
    AppError::ConfigError(format!(
        "source '{}' has no adapter table",
        definition.config.id
    ))
}
