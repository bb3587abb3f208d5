//! Browser-automation source variant.
//!
//! An [`AutomationAdapter`] borrows a session from a [`ResourcePool`] for the
//! duration of one call. The session goes back to the pool on every exit
//! path: explicitly after the script returns, or through the guard's drop
//! when the call is cancelled by a timeout.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::AdapterKind;
use crate::error::AppError;
use crate::models::{HealthReport, HealthStatus, Listing, SearchRequest};
use crate::pool::{ResourceManager, ResourcePool};
use crate::traits::SourceAdapter;

/// How long a health check waits for a free session before reporting degraded.
const HEALTH_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

/// Site-specific logic run against a pooled session.
pub trait AutomationScript<R>: Send + Sync + 'static {
    fn search(
        &self,
        session: &mut R,
        request: &SearchRequest,
        page: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<Vec<Listing>, AppError>> + Send;

    fn health_check(&self, session: &mut R) -> impl Future<Output = Result<(), AppError>> + Send;
}

pub struct AutomationAdapter<M, S>
where
    M: ResourceManager,
    S: AutomationScript<M::Resource>,
{
    id: String,
    pool: ResourcePool<M>,
    script: S,
}

impl<M, S> AutomationAdapter<M, S>
where
    M: ResourceManager,
    S: AutomationScript<M::Resource>,
{
    pub fn new(id: impl Into<String>, pool: ResourcePool<M>, script: S) -> Self {
        Self {
            id: id.into(),
            pool,
            script,
        }
    }

    pub fn pool(&self) -> &ResourcePool<M> {
        &self.pool
    }
}

#[async_trait]
impl<M, S> SourceAdapter for AutomationAdapter<M, S>
where
    M: ResourceManager,
    S: AutomationScript<M::Resource>,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Automation
    }

    async fn search(
        &self,
        request: &SearchRequest,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Listing>, AppError> {
        let mut session = self.pool.acquire().await?;
        let result = self
            .script
            .search(&mut *session, request, page, page_size)
            .await;
        session.release().await;
        result
    }

    async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let mut session = match self.pool.acquire_timeout(HEALTH_ACQUIRE_TIMEOUT).await {
            Ok(session) => session,
            Err(e) => {
                return HealthReport::with_status(
                    HealthStatus::Degraded,
                    started.elapsed(),
                    e.to_string(),
                );
            }
        };

        let result = self.script.health_check(&mut *session).await;
        session.release().await;

        match result {
            Ok(()) => HealthReport::healthy(started.elapsed()),
            Err(e) => {
                HealthReport::with_status(HealthStatus::Unhealthy, started.elapsed(), e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::PoolConfig;
    use crate::error::UpstreamErrorKind;
    use crate::testutil::{MockScript, MockSessionManager};

    fn adapter(
        script: MockScript,
        size: usize,
    ) -> (AutomationAdapter<MockSessionManager, MockScript>, MockSessionManager) {
        let manager = MockSessionManager::new();
        let pool = ResourcePool::new(
            "auction",
            manager.clone(),
            PoolConfig {
                size,
                max_overflow: 0,
                acquire_timeout_ms: 50,
            },
        );
        (AutomationAdapter::new("auction", pool, script), manager)
    }

    #[tokio::test]
    async fn releases_session_after_success() {
        let script = MockScript::returning(vec![Listing::new("auction", "1", "2018 Mazda 3")]);
        let (adapter, manager) = adapter(script, 1);
        adapter.pool().start().await.unwrap();

        let listings = adapter.search(&SearchRequest::new(), 1, 10).await.unwrap();
        assert_eq!(listings.len(), 1);

        let stats = adapter.pool().stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 0);
        assert_eq!(manager.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn releases_session_after_failure() {
        let script = MockScript::failing(AppError::upstream(
            "auction",
            UpstreamErrorKind::Parse,
            "layout changed",
        ));
        let (adapter, _) = adapter(script, 1);
        adapter.pool().start().await.unwrap();

        assert!(adapter.search(&SearchRequest::new(), 1, 10).await.is_err());
        assert_eq!(adapter.pool().stats().idle, 1);
    }

    #[tokio::test]
    async fn releases_session_when_cancelled() {
        let script = MockScript::returning(Vec::new()).with_delay(Duration::from_secs(5));
        let (adapter, _) = adapter(script, 1);
        adapter.pool().start().await.unwrap();

        let request = SearchRequest::new();
        let result =
            tokio::time::timeout(Duration::from_millis(20), adapter.search(&request, 1, 10)).await;
        assert!(result.is_err());

        // The dropped guard returns the session from a background task.
        let session = adapter.pool().acquire_timeout(Duration::from_secs(1)).await;
        assert!(session.is_ok());
    }

    #[tokio::test]
    async fn health_reports_degraded_when_pool_busy() {
        let (adapter, _) = adapter(MockScript::returning(Vec::new()), 1);
        adapter.pool().start().await.unwrap();
        let _held = adapter.pool().acquire().await.unwrap();

        let report = adapter.health_check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
    }
}
