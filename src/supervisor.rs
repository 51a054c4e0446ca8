//! Rendering engine supervision
//!
//! One engine process serves every capture. The [`Supervisor`] launches it,
//! watches its disconnect signal and relaunches it in place when it dies
//! unexpectedly. Other components read the live engine through the shared
//! [`EngineHandle`] and learn about replacements through [`EngineListener`].

use crate::engine::{EngineLauncher, RenderEngine};
use crate::{CaptureError, EngineError, Metrics};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// The engine currently serving captures, tagged with its launch generation
#[derive(Clone)]
pub struct LiveEngine {
    pub engine: Arc<dyn RenderEngine>,
    pub generation: u64,
}

/// Read side of the supervised engine
#[derive(Default)]
pub struct EngineHandle {
    current: RwLock<Option<LiveEngine>>,
}

impl EngineHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `None` while the engine is stopped or being replaced.
    pub fn current(&self) -> Option<LiveEngine> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> Option<u64> {
        self.current().map(|live| live.generation)
    }

    fn replace(&self, next: Option<LiveEngine>) -> Option<LiveEngine> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, next)
    }
}

/// Notified around engine replacement
#[async_trait]
pub trait EngineListener: Send + Sync {
    /// The engine went away; anything derived from it is now invalid.
    async fn engine_lost(&self);

    async fn engine_ready(&self);
}

struct RestartGuard<'a>(&'a AtomicBool);

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Supervisor {
    launcher: Arc<dyn EngineLauncher>,
    handle: Arc<EngineHandle>,
    metrics: Arc<Metrics>,
    closed: AtomicBool,
    restarting: AtomicBool,
    generation: AtomicU64,
    restarts: AtomicUsize,
    launch_timeout: Duration,
    listeners: Mutex<Vec<Weak<dyn EngineListener>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn EngineLauncher>, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            handle: EngineHandle::new(),
            metrics,
            closed: AtomicBool::new(true),
            restarting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            restarts: AtomicUsize::new(0),
            launch_timeout: Duration::from_secs(30),
            listeners: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        })
    }

    pub fn handle(&self) -> Arc<EngineHandle> {
        self.handle.clone()
    }

    pub fn subscribe(&self, listener: Weak<dyn EngineListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .current()
            .map(|live| live.engine.is_connected())
            .unwrap_or(false)
    }

    /// Launch the engine; returns once it accepts commands.
    pub async fn start(self: &Arc<Self>) -> Result<(), CaptureError> {
        self.closed.store(false, Ordering::SeqCst);
        let engine = self.launch().await?;
        self.install(engine).await;
        info!("Rendering engine started");
        Ok(())
    }

    /// Suppress restarts ahead of [`stop`](Self::stop), leaving the engine up
    /// for captures still in flight.
    pub fn mark_closing(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Close the engine for good. No restart happens afterwards.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(watcher) = self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take() {
            watcher.abort();
        }
        if let Some(live) = self.handle.replace(None) {
            self.notify_lost().await;
            if let Err(e) = live.engine.close().await {
                debug!("engine close after stop: {}", e);
            }
        }
        info!("Rendering engine stopped");
    }

    /// Relaunch the engine if it should be running and isn't.
    pub async fn ensure_running(self: &Arc<Self>) -> Result<(), CaptureError> {
        if self.is_closed() || self.is_running() {
            return Ok(());
        }
        warn!("Rendering engine is not running, restarting");
        self.restart().await
    }

    async fn handle_disconnect(self: &Arc<Self>, generation: u64) {
        if self.is_closed() {
            info!("Rendering engine closed");
            return;
        }
        if self.handle.generation() != Some(generation) {
            debug!(generation, "ignoring disconnect of a replaced engine");
            return;
        }
        warn!("Rendering engine disconnected unexpectedly, restarting");
        // this runs on the watcher task; detach it so install() doesn't abort it
        drop(self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take());
        if let Err(e) = self.restart().await {
            error!("Rendering engine restart failed: {}", e);
        }
    }

    /// Drop the current engine and its contexts, then launch a new one.
    ///
    /// Concurrent calls collapse into the one already in flight. A failed
    /// launch is not retried here; the next disconnect or health check will.
    pub async fn restart(self: &Arc<Self>) -> Result<(), CaptureError> {
        if self.restarting.swap(true, Ordering::SeqCst) {
            debug!("engine restart already in progress");
            return Ok(());
        }
        let _guard = RestartGuard(&self.restarting);

        if let Some(live) = self.handle.replace(None) {
            self.notify_lost().await;
            if let Ok(Err(e)) = timeout(Duration::from_secs(5), live.engine.close()).await {
                debug!("closing lost engine: {}", e);
            }
        }

        let engine = self.launch().await?;
        if self.is_closed() {
            if let Err(e) = engine.close().await {
                debug!("closing engine launched during shutdown: {}", e);
            }
            return Ok(());
        }
        self.install(engine).await;
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_engine_restart();
        info!(restarts = self.restart_count(), "Rendering engine restarted");
        Ok(())
    }

    async fn launch(&self) -> Result<Arc<dyn RenderEngine>, CaptureError> {
        match timeout(self.launch_timeout, self.launcher.launch()).await {
            Ok(Ok(engine)) => Ok(engine),
            Ok(Err(e)) => {
                error!("Failed to launch rendering engine: {}", e);
                Err(e.into())
            }
            Err(_) => Err(EngineError::Launch(format!(
                "engine did not start within {:?}",
                self.launch_timeout
            ))
            .into()),
        }
    }

    fn install<'a>(
        self: &'a Arc<Self>,
        engine: Arc<dyn RenderEngine>,
    ) -> impl std::future::Future<Output = ()> + Send + 'a {
        async move {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let mut signal = engine.disconnected();
            self.handle.replace(Some(LiveEngine { engine, generation }));

            let supervisor = Arc::downgrade(self);
            let watcher = tokio::spawn(async move {
                signal.wait().await;
                if let Some(supervisor) = supervisor.upgrade() {
                    supervisor.handle_disconnect(generation).await;
                }
            });
            if let Some(previous) = self
                .watcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(watcher)
            {
                previous.abort();
            }

            for listener in self.listeners() {
                listener.engine_ready().await;
            }
        }
    }

    async fn notify_lost(&self) {
        for listener in self.listeners() {
            listener.engine_lost().await;
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn EngineListener>> {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}
