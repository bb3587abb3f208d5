pub mod automation;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod merge;
pub mod models;
pub mod pool;
pub mod progress;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use cache::{CacheEntry, ResultCache, TtlClass};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use config::{
    AdapterKind, CacheConfig, CircuitBreakerConfig, EngineConfig, PoolConfig, RateLimitConfig,
    RetryPolicy, SchedulerConfig, SourceConfig,
};
pub use error::{AppError, UpstreamErrorKind};
pub use models::{
    AggregationResult, FailureKind, HealthReport, HealthStatus, Listing, SearchRequest,
    SkipReason, SkippedSource, SortOrder, SourceFailure, compute_hash,
};
pub use pool::{PoolStats, PooledResource, ResourceManager, ResourcePool};
pub use progress::{ProgressEvent, ProgressReporter, ProgressSnapshot, SourceStatus};
pub use rate_limiter::RateLimiter;
pub use registry::SourceRegistry;
pub use scheduler::{Aggregator, SourceHealth, SourceStats};
pub use traits::{DurableCache, ListingStore, SourceAdapter};
