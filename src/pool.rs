//! Render context pool
//!
//! A bounded pool of isolated browsing contexts taken from the supervised
//! engine. Each running capture leases exactly one context; the pool never
//! holds more than `max` contexts in total and keeps at least `min` warm.
//!
//! Contexts remember the engine generation they were created on, so anything
//! left over from a crashed engine is discarded instead of being handed out.

use crate::engine::RenderContext;
use crate::supervisor::{EngineHandle, EngineListener};
use crate::{CaptureError, Metrics};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

struct PooledContext {
    context: Box<dyn RenderContext>,
    generation: u64,
    created_at: Instant,
    uses: usize,
}

impl PooledContext {
    async fn close(self) {
        match timeout(CLOSE_TIMEOUT, self.context.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("closing context {}: {}", self.context.id(), e),
            Err(_) => warn!(
                "context {} did not close within {:?}",
                self.context.id(),
                CLOSE_TIMEOUT
            ),
        }
    }
}

#[derive(Debug, Clone)]
struct LeaseInfo {
    context_id: String,
    since: Instant,
}

/// Exclusive use of one context for one capture
///
/// Hand it back with [`ContextPool::release`] once the context is clean, or
/// [`ContextPool::destroy`] it. A lease dropped without either is destroyed.
pub struct ContextLease {
    pooled: Option<PooledContext>,
    permit: Option<OwnedSemaphorePermit>,
    lease_id: u64,
    pool: Arc<ContextPool>,
}

impl ContextLease {
    pub fn context(&self) -> &dyn RenderContext {
        // only empty after release/destroy, which consume the lease
        self.pooled
            .as_ref()
            .map(|p| p.context.as_ref())
            .expect("lease holds a context until consumed")
    }

    pub fn id(&self) -> &str {
        self.context().id()
    }

    pub fn generation(&self) -> u64 {
        self.pooled.as_ref().map(|p| p.generation).unwrap_or_default()
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        self.pool.forget_lease(self.lease_id);
        let Some(pooled) = self.pooled.take() else {
            return;
        };
        let permit = self.permit.take();
        let pool = self.pool.clone();
        warn!("context {} dropped without cleanup, destroying", pooled.context.id());
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                pool.discard(pooled).await;
                drop(permit);
            });
        }
    }
}

pub struct ContextPool {
    engine: Arc<EngineHandle>,
    metrics: Arc<Metrics>,
    max: usize,
    min: usize,
    idle: Mutex<VecDeque<PooledContext>>,
    semaphore: Arc<Semaphore>,
    leased: DashMap<u64, LeaseInfo>,
    next_lease: AtomicU64,
    live: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    max_in_use: AtomicUsize,
    is_shutting_down: AtomicBool,
}

impl ContextPool {
    pub fn new(
        engine: Arc<EngineHandle>,
        max: usize,
        min: usize,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let max = max.max(1);
        Arc::new(Self {
            engine,
            metrics,
            max,
            min: min.clamp(1, max),
            idle: Mutex::new(VecDeque::new()),
            semaphore: Arc::new(Semaphore::new(max)),
            leased: DashMap::new(),
            next_lease: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            max_in_use: AtomicUsize::new(0),
            is_shutting_down: AtomicBool::new(false),
        })
    }

    pub fn max_size(&self) -> usize {
        self.max
    }

    pub fn in_use(&self) -> usize {
        self.leased.len()
    }

    /// Contexts currently alive, idle or leased.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Lease an idle context, creating one if the pool is below its maximum.
    ///
    /// Waits at most `wait` for a context to be released when the pool is full.
    pub async fn acquire(self: &Arc<Self>, wait: Duration) -> Result<ContextLease, CaptureError> {
        if self.is_shutting_down.load(Ordering::SeqCst) {
            return Err(CaptureError::EngineUnavailable);
        }

        let permit = match timeout(wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(CaptureError::EngineUnavailable),
            Err(_) => return Err(CaptureError::AcquireTimeout(wait)),
        };

        let live = self.engine.current().ok_or(CaptureError::EngineUnavailable)?;

        let reused = loop {
            let candidate = self.idle.lock().await.pop_front();
            match candidate {
                Some(pooled) if pooled.generation == live.generation => break Some(pooled),
                Some(stale) => self.discard(stale).await,
                None => break None,
            }
        };

        let mut pooled = match reused {
            Some(pooled) => pooled,
            None => {
                let context = live.engine.new_context().await?;
                self.live.fetch_add(1, Ordering::SeqCst);
                self.created.fetch_add(1, Ordering::SeqCst);
                debug!("created context {}", context.id());
                PooledContext {
                    context,
                    generation: live.generation,
                    created_at: Instant::now(),
                    uses: 0,
                }
            }
        };
        pooled.uses += 1;

        let lease_id = self.next_lease.fetch_add(1, Ordering::SeqCst);
        self.leased.insert(
            lease_id,
            LeaseInfo {
                context_id: pooled.context.id().to_string(),
                since: Instant::now(),
            },
        );
        let in_use = self.leased.len();
        self.max_in_use.fetch_max(in_use, Ordering::SeqCst);
        self.metrics.set_contexts_in_use(in_use);

        Ok(ContextLease {
            pooled: Some(pooled),
            permit: Some(permit),
            lease_id,
            pool: self.clone(),
        })
    }

    /// Return a context whose per-request state has been cleared.
    pub async fn release(&self, mut lease: ContextLease) {
        self.forget_lease(lease.lease_id);
        let Some(pooled) = lease.pooled.take() else {
            return;
        };
        let permit = lease.permit.take();

        let current = self.engine.generation();
        if self.is_shutting_down.load(Ordering::SeqCst) || current != Some(pooled.generation) {
            self.discard(pooled).await;
        } else {
            self.idle.lock().await.push_back(pooled);
        }
        drop(permit);
    }

    /// Permanently discard a context that can't be trusted anymore.
    pub async fn destroy(&self, mut lease: ContextLease) {
        self.forget_lease(lease.lease_id);
        let Some(pooled) = lease.pooled.take() else {
            return;
        };
        let permit = lease.permit.take();
        self.discard(pooled).await;
        drop(permit);
    }

    async fn discard(&self, pooled: PooledContext) {
        debug!(
            "destroying context {} after {} uses ({:?} old)",
            pooled.context.id(),
            pooled.uses,
            pooled.created_at.elapsed()
        );
        pooled.close().await;
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_context_destroyed();
    }

    fn forget_lease(&self, lease_id: u64) {
        if self.leased.remove(&lease_id).is_some() {
            self.metrics.set_contexts_in_use(self.leased.len());
        }
    }

    /// Discard every idle context. Leased ones are discarded on return.
    pub async fn clear(&self) {
        let drained: Vec<_> = self.idle.lock().await.drain(..).collect();
        if !drained.is_empty() {
            info!("clearing {} idle contexts", drained.len());
        }
        for pooled in drained {
            self.discard(pooled).await;
        }
    }

    /// Create idle contexts until the pool holds its minimum, within the maximum.
    pub async fn warm(&self) {
        if self.is_shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Some(live) = self.engine.current() else {
            return;
        };

        loop {
            let idle = self.idle.lock().await.len();
            if idle >= self.min || self.live() >= self.max {
                break;
            }
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            match live.engine.new_context().await {
                Ok(context) => {
                    self.live.fetch_add(1, Ordering::SeqCst);
                    self.created.fetch_add(1, Ordering::SeqCst);
                    self.idle.lock().await.push_back(PooledContext {
                        context,
                        generation: live.generation,
                        created_at: Instant::now(),
                        uses: 0,
                    });
                }
                Err(e) => {
                    warn!("could not warm context pool: {}", e);
                    break;
                }
            }
            drop(permit);
        }
    }

    /// Stop handing out contexts and destroy them all, waiting up to `grace`
    /// for leased contexts to come back.
    pub async fn drain(&self, grace: Duration) {
        info!("Draining context pool...");
        self.is_shutting_down.store(true, Ordering::SeqCst);
        self.semaphore.close();

        let deadline = Instant::now() + grace;
        while !self.leased.is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(100)).await;
        }
        if !self.leased.is_empty() {
            warn!("{} contexts still leased after {:?}", self.leased.len(), grace);
        }
        self.clear().await;
        info!("Context pool drained");
    }

    /// Leases held longer than `threshold`.
    pub fn stuck_leases(&self, threshold: Duration) -> Vec<(String, Duration)> {
        self.leased
            .iter()
            .filter(|entry| entry.since.elapsed() > threshold)
            .map(|entry| (entry.context_id.clone(), entry.since.elapsed()))
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().await.len();
        PoolStats {
            max: self.max,
            live: self.live(),
            idle,
            in_use: self.in_use(),
            max_in_use: self.max_in_use.load(Ordering::SeqCst),
            created: self.created.load(Ordering::SeqCst),
            destroyed: self.destroyed.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl EngineListener for ContextPool {
    async fn engine_lost(&self) {
        self.clear().await;
    }

    async fn engine_ready(&self) {
        self.warm().await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub max: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Highest number of simultaneously leased contexts seen.
    pub max_in_use: usize,
    pub created: usize,
    pub destroyed: usize,
}
