//! Capability interface to the rendering engine
//!
//! The capture core never talks to a browser directly. It drives these traits:
//! an [`EngineLauncher`] produces one [`RenderEngine`] (the long-lived process),
//! which hands out isolated [`RenderContext`]s, each of which opens
//! single-use [`RenderSession`]s (pages).

pub mod chromium;
#[cfg(test)]
pub mod fake;

use crate::print::PrintOptions;
use crate::readiness::CaptureTrigger;
use crate::{EngineError, Viewport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

/// Name of the function a target page calls to signal it is ready.
pub const TRIGGER_FUNCTION: &str = "triggerCapture";

/// Name of the `<meta>` tag a page uses to request explicit triggering.
pub const CAPTURE_META: &str = "x-capture";

/// A cookie as set on, or read back from, a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// URL the cookie is scoped to when set.
    pub url: Option<String>,
    pub domain: Option<String>,
    pub path: Option<String>,
}

impl Cookie {
    pub fn for_url(name: impl Into<String>, value: impl Into<String>, url: &Url) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            url: Some(url.to_string()),
            domain: None,
            path: None,
        }
    }
}

/// Fires once when an engine loses its connection
pub struct DisconnectNotifier {
    tx: watch::Sender<bool>,
}

impl DisconnectNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn notify(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_disconnected(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> DisconnectSignal {
        DisconnectSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for DisconnectNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct DisconnectSignal {
    rx: watch::Receiver<bool>,
}

impl DisconnectSignal {
    /// Resolves once the engine is disconnected (or its notifier is gone).
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Launch the engine, returning once it accepts commands.
    async fn launch(&self) -> Result<Arc<dyn RenderEngine>, EngineError>;
}

#[async_trait]
pub trait RenderEngine: Send + Sync {
    fn disconnected(&self) -> DisconnectSignal;

    fn is_connected(&self) -> bool;

    /// Create an isolated browsing context with its own cookie and storage jar.
    async fn new_context(&self) -> Result<Box<dyn RenderContext>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait RenderContext: Send + Sync {
    fn id(&self) -> &str;

    async fn new_session(&self) -> Result<Box<dyn RenderSession>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

#[async_trait]
pub trait RenderSession: Send + Sync {
    async fn emulate_timezone(&self, timezone: &str) -> Result<(), EngineError>;

    /// Accept-Language plus `navigator.language(s)` for documents loaded afterwards.
    async fn emulate_locale(&self, lang: &str) -> Result<(), EngineError>;

    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), EngineError>;

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), EngineError>;

    async fn cookies(&self) -> Result<Vec<Cookie>, EngineError>;

    async fn delete_cookies(&self, cookies: &[Cookie]) -> Result<(), EngineError>;

    /// Make `name` callable from page scripts; the first call fires `trigger`.
    async fn expose_trigger(&self, name: &str, trigger: CaptureTrigger) -> Result<(), EngineError>;

    /// Navigate and resolve once the network has been idle.
    ///
    /// Returns [`EngineError::Timeout`] if idleness isn't reached within `timeout`.
    async fn navigate(&self, url: &Url, timeout: Duration) -> Result<(), EngineError>;

    /// Content of `<head><meta name=...>`, `None` when absent.
    async fn meta_content(&self, name: &str) -> Result<Option<String>, EngineError>;

    /// PNG of the current viewport.
    async fn screenshot(&self) -> Result<Vec<u8>, EngineError>;

    async fn print_pdf(&self, options: &PrintOptions) -> Result<Vec<u8>, EngineError>;

    /// Call the page's `animateCaptureFrame()`, `true` once the animation is over.
    async fn advance_animation(&self) -> Result<bool, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}
