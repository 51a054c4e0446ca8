use crate::CaptureError;
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Handles to every metric the service records
///
/// Handles are resolved against the global recorder when the struct is built,
/// so install the exporter first. Without a recorder every handle is a no-op.
pub struct Metrics {
    pub captures_taken: Counter,
    pub captures_failed: Counter,
    pub capture_duration: Histogram,
    pub queue_size: Gauge,
    pub running_captures: Gauge,
    pub contexts_in_use: Gauge,
    pub contexts_destroyed: Counter,
    pub cleanup_failures: Counter,
    pub engine_restarts: Counter,
    pub soft_timeouts: Counter,
    pub timeout_errors: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            captures_taken: counter!("capture_requests_succeeded_total"),
            captures_failed: counter!("capture_requests_failed_total"),
            capture_duration: histogram!("capture_duration_seconds"),
            queue_size: gauge!("capture_queue_size"),
            running_captures: gauge!("capture_running"),
            contexts_in_use: gauge!("capture_contexts_in_use"),
            contexts_destroyed: counter!("capture_contexts_destroyed_total"),
            cleanup_failures: counter!("capture_cleanup_failures_total"),
            engine_restarts: counter!("capture_engine_restarts_total"),
            soft_timeouts: counter!("capture_soft_timeouts_total"),
            timeout_errors: counter!("capture_timeouts_total"),
        }
    }

    pub fn record_capture(&self, kind: &'static str, duration: Duration, success: bool) {
        if success {
            self.captures_taken.increment(1);
        } else {
            self.captures_failed.increment(1);
        }
        self.capture_duration.record(duration.as_secs_f64());
        counter!("capture_requests_by_kind_total", "kind" => kind).increment(1);
    }

    pub fn record_error(&self, error: &CaptureError) {
        if error.is_timeout() {
            self.timeout_errors.increment(1);
        }
        counter!("capture_errors_total", "kind" => error.kind()).increment(1);
    }

    /// A failure the caller never sees: a readiness wait that ran out but
    /// still produced a capture, or a context whose cleanup failed.
    pub fn record_soft_failure(&self, error: &CaptureError) {
        match error {
            CaptureError::NavigationTimeout(_) => self.soft_timeouts.increment(1),
            CaptureError::CleanupFailure(_) => self.cleanup_failures.increment(1),
            _ => {}
        }
        counter!("capture_soft_failures_total", "kind" => error.kind()).increment(1);
    }

    pub fn record_context_destroyed(&self) {
        self.contexts_destroyed.increment(1);
    }

    pub fn record_engine_restart(&self) {
        self.engine_restarts.increment(1);
    }

    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.set(size as f64);
    }

    pub fn set_running(&self, count: usize) {
        self.running_captures.set(count as f64);
    }

    pub fn set_contexts_in_use(&self, count: usize) {
        self.contexts_in_use.set(count as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the global Prometheus recorder, returning the handle `/metrics` renders from.
pub fn install_prometheus() -> Result<PrometheusHandle, CaptureError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CaptureError::Configuration(format!("metrics recorder: {e}")))?;
    info!("Prometheus recorder installed");
    Ok(handle)
}
