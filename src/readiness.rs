//! Page readiness protocol
//!
//! Decides when a navigated page can be captured. Three strategies are
//! layered, cheapest first:
//!
//! ```text
//! Navigating ──network idle──▶ MetaCheck ──x-capture=trigger──▶ ExplicitTriggerWait ──▶ Ready
//!     │                            └──────otherwise──────────▶ SafetyDelay ─────────▶ Ready
//!     ├──triggerCapture()──────────────────────────────────────────────────────────▶ Ready
//!     └──timeout──▶ TimedOut ─────────────────────────────────────────────────────────▶ Ready
//! ```
//!
//! Timeouts here are soft: a slow page is captured as it stands.

use crate::engine::{RenderSession, CAPTURE_META, TRIGGER_FUNCTION};
use crate::{CaptureError, EngineError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use url::Url;

/// Callable half of the in-page trigger, handed to the engine
///
/// Only the first [`fire`](CaptureTrigger::fire) has an effect.
#[derive(Debug, Clone)]
pub struct CaptureTrigger {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl CaptureTrigger {
    /// Returns `true` if this call fired the trigger.
    pub fn fire(&self) -> bool {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Awaitable half of the in-page trigger
#[derive(Debug)]
pub struct TriggerWait {
    rx: oneshot::Receiver<()>,
    fired: bool,
    closed: bool,
}

impl TriggerWait {
    /// Resolves when the page calls the trigger; never resolves if it can't anymore.
    pub async fn fired(&mut self) {
        if self.fired {
            return;
        }
        if !self.closed {
            match (&mut self.rx).await {
                Ok(()) => {
                    self.fired = true;
                    return;
                }
                Err(_) => self.closed = true,
            }
        }
        std::future::pending::<()>().await
    }

    pub fn has_fired(&mut self) -> bool {
        if !self.fired && !self.closed {
            match self.rx.try_recv() {
                Ok(()) => self.fired = true,
                Err(TryRecvError::Closed) => self.closed = true,
                Err(TryRecvError::Empty) => {}
            }
        }
        self.fired
    }
}

pub fn trigger_channel() -> (CaptureTrigger, TriggerWait) {
    let (tx, rx) = oneshot::channel();
    (
        CaptureTrigger {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        TriggerWait {
            rx,
            fired: false,
            closed: false,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    Navigating,
    NetworkIdle,
    MetaCheck,
    ExplicitTriggerWait,
    SafetyDelay,
    TimedOut,
    Ready,
}

/// How a page became ready, for observability only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The page called the trigger while loading.
    Triggered,
    /// Navigation hit the timeout; the page is captured as-is.
    NavigationTimedOut,
    /// The page asked for explicit triggering and called it after network idle.
    TriggeredAfterIdle,
    /// The page asked for explicit triggering and never called it.
    TriggerWaitTimedOut,
    /// Network went idle and the safety delay elapsed.
    SafetyDelayElapsed,
}

impl ReadinessOutcome {
    pub fn timed_out(&self) -> bool {
        matches!(
            self,
            ReadinessOutcome::NavigationTimedOut | ReadinessOutcome::TriggerWaitTimedOut
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessSettings {
    pub timeout: Duration,
    pub safety_delay: Duration,
}

pub struct PageReadiness<'a> {
    session: &'a dyn RenderSession,
    target: &'a Url,
    settings: ReadinessSettings,
    states: Vec<ReadinessState>,
}

impl<'a> PageReadiness<'a> {
    pub fn new(
        session: &'a dyn RenderSession,
        target: &'a Url,
        settings: ReadinessSettings,
    ) -> Self {
        Self {
            session,
            target,
            settings,
            states: Vec::new(),
        }
    }

    /// States visited so far, in order.
    pub fn states(&self) -> &[ReadinessState] {
        &self.states
    }

    pub fn state(&self) -> Option<ReadinessState> {
        self.states.last().copied()
    }

    fn enter(&mut self, state: ReadinessState) {
        debug!(target_url = %self.target, ?state, "readiness transition");
        self.states.push(state);
    }

    /// Expose the trigger, navigate, and wait until the page can be captured.
    ///
    /// Only a non-timeout navigation failure is an error.
    pub async fn run(&mut self) -> Result<ReadinessOutcome, CaptureError> {
        let (trigger, mut wait) = trigger_channel();
        self.session.expose_trigger(TRIGGER_FUNCTION, trigger).await?;

        self.enter(ReadinessState::Navigating);
        let limit = self.settings.timeout;
        let navigation = timeout(limit, self.session.navigate(self.target, limit));

        let navigated = tokio::select! {
            result = navigation => Some(result),
            _ = wait.fired() => None,
        };

        let outcome = match navigated {
            None => {
                debug!(
                    "Capture was explicitly triggered by {} for {}",
                    TRIGGER_FUNCTION, self.target
                );
                ReadinessOutcome::Triggered
            }
            Some(Err(_)) | Some(Ok(Err(EngineError::Timeout(_)))) => {
                warn!("timeout of {:?} was reached for {}", limit, self.target);
                self.enter(ReadinessState::TimedOut);
                ReadinessOutcome::NavigationTimedOut
            }
            Some(Ok(Err(err))) => return Err(err.into()),
            Some(Ok(Ok(()))) if wait.has_fired() => ReadinessOutcome::Triggered,
            Some(Ok(Ok(()))) => {
                debug!("network was idle for {}", self.target);
                self.enter(ReadinessState::NetworkIdle);
                self.after_network_idle(&mut wait).await
            }
        };

        self.enter(ReadinessState::Ready);
        Ok(outcome)
    }

    async fn after_network_idle(&mut self, wait: &mut TriggerWait) -> ReadinessOutcome {
        self.enter(ReadinessState::MetaCheck);
        let meta = match self.session.meta_content(CAPTURE_META).await {
            Ok(meta) => meta,
            Err(err) => {
                debug!("could not read {} meta for {}: {}", CAPTURE_META, self.target, err);
                None
            }
        };

        if meta.as_deref().map(str::trim) == Some("trigger") {
            self.enter(ReadinessState::ExplicitTriggerWait);
            debug!("waiting for explicit {} call for {}", TRIGGER_FUNCTION, self.target);
            match timeout(self.settings.timeout, wait.fired()).await {
                Ok(()) => {
                    debug!(
                        "Capture was explicitly triggered by {} for {}",
                        TRIGGER_FUNCTION, self.target
                    );
                    ReadinessOutcome::TriggeredAfterIdle
                }
                Err(_) => {
                    warn!(
                        "timeout of {:?} was reached waiting for {} on {}",
                        self.settings.timeout, TRIGGER_FUNCTION, self.target
                    );
                    self.enter(ReadinessState::TimedOut);
                    ReadinessOutcome::TriggerWaitTimedOut
                }
            }
        } else {
            self.enter(ReadinessState::SafetyDelay);
            debug!(
                "wait {:?} more after idle network for {}",
                self.settings.safety_delay, self.target
            );
            sleep(self.settings.safety_delay).await;
            ReadinessOutcome::SafetyDelayElapsed
        }
    }
}
