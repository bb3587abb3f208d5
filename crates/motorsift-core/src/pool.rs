//! Bounded pool of expensive, stateful sessions.
//!
//! The pool is pre-warmed by [`ResourcePool::start`] and torn down by
//! [`ResourcePool::shutdown`]. A checked-out resource is wrapped in a
//! [`PooledResource`] guard that owns it exclusively; dropping the guard
//! (including on cancellation) hands the resource back in the background.
//!
//! Idle resources are mirrored one-to-one by semaphore permits, so a waiter
//! that obtains a permit is guaranteed to find an idle resource.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;

use crate::config::PoolConfig;
use crate::error::AppError;

/// Lifecycle hooks for the pooled resource type.
pub trait ResourceManager: Send + Sync + 'static {
    type Resource: Send + 'static;

    fn create(&self) -> impl Future<Output = Result<Self::Resource, AppError>> + Send;

    /// Bring a returned resource back to a neutral state. An error discards it.
    fn reset(
        &self,
        resource: &mut Self::Resource,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn close(&self, resource: Self::Resource) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub max_overflow: usize,
    pub idle: usize,
    pub in_use: usize,
    pub live: usize,
    pub created: u64,
    pub overflow_created: u64,
    pub discarded: u64,
    pub closed: bool,
}

struct PoolState<R> {
    idle: VecDeque<R>,
    /// Resources that exist right now, idle or checked out.
    live: usize,
    closed: bool,
    created: u64,
    overflow_created: u64,
    discarded: u64,
}

struct PoolShared<M: ResourceManager> {
    name: String,
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Resource>>,
    available: Semaphore,
}

pub struct ResourcePool<M: ResourceManager> {
    shared: Arc<PoolShared<M>>,
}

impl<M: ResourceManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ResourceManager> ResourcePool<M> {
    pub fn new(name: impl Into<String>, manager: M, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                manager,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: 0,
                    closed: false,
                    created: 0,
                    overflow_created: 0,
                    discarded: 0,
                }),
                available: Semaphore::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Create resources until `size` exist. Returns how many were created.
    ///
    /// Creation failures are logged and left for lazy creation on acquire.
    pub async fn start(&self) -> Result<usize, AppError> {
        let shared = &self.shared;
        let mut warmed = 0;
        loop {
            if !shared.reserve_slot(shared.config.size, false)? {
                break;
            }
            match shared.manager.create().await {
                Ok(resource) => {
                    shared.push_idle(resource);
                    warmed += 1;
                }
                Err(e) => {
                    shared.release_slot();
                    tracing::warn!(pool = %shared.name, error = %e, "Failed to pre-warm pool resource");
                    break;
                }
            }
        }
        tracing::info!(pool = %shared.name, warmed, size = shared.config.size, "Resource pool started");
        Ok(warmed)
    }

    /// Check out a resource using the configured acquire timeout.
    pub async fn acquire(&self) -> Result<PooledResource<M>, AppError> {
        self.acquire_timeout(self.shared.config.acquire_timeout()).await
    }

    /// Check out a resource, waiting at most `timeout` for one to be returned.
    ///
    /// When the wait expires the pool creates an overflow resource if the
    /// soft ceiling (`size + max_overflow`) allows it, otherwise it fails
    /// with `PoolExhausted`.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledResource<M>, AppError> {
        let shared = &self.shared;
        if shared.lock_state().closed {
            return Err(AppError::PoolClosed);
        }

        if let Ok(permit) = shared.available.try_acquire() {
            permit.forget();
            return shared.pop_idle().map(|r| self.guard(r));
        }

        if shared.reserve_slot(shared.config.size, false)? {
            return self.create_reserved().await;
        }

        match tokio::time::timeout(timeout, shared.available.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                shared.pop_idle().map(|r| self.guard(r))
            }
            Ok(Err(_)) => Err(AppError::PoolClosed),
            Err(_) => {
                let ceiling = shared.config.size + shared.config.max_overflow;
                if shared.reserve_slot(ceiling, true)? {
                    tracing::debug!(pool = %shared.name, "Creating overflow resource");
                    self.create_reserved().await
                } else {
                    tracing::warn!(
                        pool = %shared.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "Resource pool exhausted"
                    );
                    Err(AppError::PoolExhausted(timeout.as_millis() as u64))
                }
            }
        }
    }

    /// Close every idle resource and refuse further acquisitions.
    ///
    /// Resources still checked out are closed when they come back.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let drained: Vec<M::Resource> = {
            let mut state = shared.lock_state();
            state.closed = true;
            let idle = state.idle.len();
            state.live -= idle;
            state.idle.drain(..).collect()
        };
        shared.available.close();

        let count = drained.len();
        for resource in drained {
            shared.manager.close(resource).await;
        }
        tracing::info!(pool = %shared.name, closed = count, "Resource pool shut down");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        let idle = state.idle.len();
        PoolStats {
            size: self.shared.config.size,
            max_overflow: self.shared.config.max_overflow,
            idle,
            in_use: state.live.saturating_sub(idle),
            live: state.live,
            created: state.created,
            overflow_created: state.overflow_created,
            discarded: state.discarded,
            closed: state.closed,
        }
    }

    async fn create_reserved(&self) -> Result<PooledResource<M>, AppError> {
        match self.shared.manager.create().await {
            Ok(resource) => Ok(self.guard(resource)),
            Err(e) => {
                self.shared.release_slot();
                Err(e)
            }
        }
    }

    fn guard(&self, resource: M::Resource) -> PooledResource<M> {
        PooledResource {
            resource: Some(resource),
            pool: Arc::clone(&self.shared),
        }
    }
}

impl<M: ResourceManager> PoolShared<M> {
    /// Acquires the state lock, recovering from poison if necessary.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState<M::Resource>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(pool = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Count a resource about to be created if fewer than `limit` exist.
    fn reserve_slot(&self, limit: usize, overflow: bool) -> Result<bool, AppError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(AppError::PoolClosed);
        }
        if state.live >= limit {
            return Ok(false);
        }
        state.live += 1;
        state.created += 1;
        if overflow {
            state.overflow_created += 1;
        }
        Ok(true)
    }

    fn release_slot(&self) {
        let mut state = self.lock_state();
        state.live = state.live.saturating_sub(1);
    }

    fn push_idle(&self, resource: M::Resource) {
        self.lock_state().idle.push_back(resource);
        self.available.add_permits(1);
    }

    fn pop_idle(&self) -> Result<M::Resource, AppError> {
        self.lock_state()
            .idle
            .pop_front()
            .ok_or_else(|| AppError::Generic(format!("pool '{}' idle queue out of sync", self.name)))
    }

    async fn give_back(&self, mut resource: M::Resource) {
        if self.lock_state().closed {
            self.discard(resource).await;
            return;
        }

        if let Err(e) = self.manager.reset(&mut resource).await {
            tracing::warn!(pool = %self.name, error = %e, "Reset failed, discarding resource");
            self.discard(resource).await;
            return;
        }

        let rejected = {
            let mut state = self.lock_state();
            if state.closed || state.idle.len() >= self.config.size {
                Some(resource)
            } else {
                state.idle.push_back(resource);
                None
            }
        };

        match rejected {
            Some(resource) => self.discard(resource).await,
            None => self.available.add_permits(1),
        }
    }

    async fn discard(&self, resource: M::Resource) {
        {
            let mut state = self.lock_state();
            state.live = state.live.saturating_sub(1);
            state.discarded += 1;
        }
        self.manager.close(resource).await;
        tracing::debug!(pool = %self.name, "Discarded pool resource");
    }
}

/// Exclusive handle on a pooled resource.
pub struct PooledResource<M: ResourceManager> {
    resource: Option<M::Resource>,
    pool: Arc<PoolShared<M>>,
}

impl<M: ResourceManager> PooledResource<M> {
    /// Reset the resource and return it to the pool.
    ///
    /// The hand-back runs on its own task, so it completes even when the
    /// caller stops waiting (for example under `tokio::time::timeout`).
    pub async fn release(mut self) {
        if let Some(resource) = self.resource.take() {
            let pool = Arc::clone(&self.pool);
            finish_detached(&self.pool.name, async move { pool.give_back(resource).await }).await;
        }
    }

    /// Close the resource instead of returning it.
    pub async fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            let pool = Arc::clone(&self.pool);
            finish_detached(&self.pool.name, async move { pool.discard(resource).await }).await;
        }
    }
}

async fn finish_detached<F>(pool: &str, work: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Err(e) = tokio::spawn(work).await {
        tracing::warn!(pool = %pool, error = %e, "Returning pool resource failed");
    }
}

impl<M: ResourceManager> Deref for PooledResource<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        // Only `release`/`discard`/`drop` take the resource, and they consume the guard.
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource used after release"),
        }
    }
}

impl<M: ResourceManager> DerefMut for PooledResource<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource used after release"),
        }
    }
}

impl<M: ResourceManager> Drop for PooledResource<M> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.give_back(resource).await });
            }
            Err(_) => {
                tracing::warn!(pool = %pool.name, "No runtime to return resource; dropping it");
                let mut state = pool.lock_state();
                state.live = state.live.saturating_sub(1);
                state.discarded += 1;
            }
        }
    }
}
