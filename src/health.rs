use crate::CaptureService;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Queue depth that starts raising warnings
    pub queue_warning: usize,
    pub queue_critical: usize,
    /// Pool utilization (in use / max) considered saturated
    pub high_utilization: f64,
    /// A context leased for longer than this is reported as stuck
    pub stuck_lease_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_warning: 50,
            queue_critical: 500,
            high_utilization: 0.9,
            stuck_lease_after: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckLease {
    pub context_id: String,
    pub held_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub engine: HealthLevel,
    pub pool: HealthLevel,
    pub queue: HealthLevel,
    pub engine_connected: bool,
    pub engine_restarts: usize,
    pub contexts_in_use: usize,
    pub contexts_max: usize,
    pub queued: usize,
    pub running: usize,
    pub stuck_leases: Vec<StuckLease>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Periodic and on-demand health evaluation of a [`CaptureService`]
pub struct HealthChecker {
    service: Arc<CaptureService>,
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(service: Arc<CaptureService>) -> Self {
        Self {
            service,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn check(&self) -> HealthStatus {
        let stats = self.service.stats().await;

        let engine = if stats.engine_running {
            HealthLevel::Healthy
        } else {
            HealthLevel::Critical
        };

        let stuck_leases: Vec<StuckLease> = self
            .service
            .pool()
            .stuck_leases(self.thresholds.stuck_lease_after)
            .into_iter()
            .map(|(context_id, held)| StuckLease {
                context_id,
                held_ms: held.as_millis(),
            })
            .collect();

        let utilization = stats.pool.in_use as f64 / stats.pool.max.max(1) as f64;
        let pool = if !stuck_leases.is_empty() || utilization >= self.thresholds.high_utilization {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        let queue = if stats.queued >= self.thresholds.queue_critical {
            HealthLevel::Critical
        } else if stats.queued >= self.thresholds.queue_warning {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        HealthStatus {
            overall: engine.max(pool).max(queue),
            engine,
            pool,
            queue,
            engine_connected: stats.engine_running,
            engine_restarts: stats.engine_restarts,
            contexts_in_use: stats.pool.in_use,
            contexts_max: stats.pool.max,
            queued: stats.queued,
            running: stats.running,
            stuck_leases,
            timestamp: chrono::Utc::now(),
        }
    }

    /// One round of the background loop: recover the engine if a restart
    /// failed earlier, then report.
    pub async fn tick(&self) -> HealthStatus {
        if let Err(e) = self.service.supervisor().ensure_running().await {
            error!("Health check could not restart the rendering engine: {}", e);
        }

        let status = self.check().await;
        match status.overall {
            HealthLevel::Healthy => info!("System health: OK"),
            HealthLevel::Warning => warn!(
                "System health: WARNING - engine: {:?}, pool: {:?} ({} stuck), queue: {:?} ({} waiting)",
                status.engine,
                status.pool,
                status.stuck_leases.len(),
                status.queue,
                status.queued
            ),
            HealthLevel::Critical => error!(
                "System health: CRITICAL - engine: {:?}, pool: {:?}, queue: {:?} ({} waiting)",
                status.engine, status.pool, status.queue, status.queued
            ),
        }
        for lease in &status.stuck_leases {
            warn!("context {} leased for {}ms", lease.context_id, lease.held_ms);
        }
        status
    }

    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately; the service was just started
            timer.tick().await;
            loop {
                timer.tick().await;
                if self.service.supervisor().is_closed() {
                    break;
                }
                self.tick().await;
            }
        })
    }
}
