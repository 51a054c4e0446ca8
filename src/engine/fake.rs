//! In-memory engine for tests
//!
//! Pages are scripted by path: when they go network-idle, whether they call
//! the trigger, what `x-capture` meta they carry. Screenshots are real PNGs
//! and PDFs are plain text describing what the page saw (URL, cookies,
//! locale, footer) so tests can assert on the session's state.

use super::{
    Cookie, DisconnectNotifier, DisconnectSignal, EngineLauncher, RenderContext, RenderEngine,
    RenderSession, CAPTURE_META,
};
use crate::print::PrintOptions;
use crate::readiness::CaptureTrigger;
use crate::{EngineError, Viewport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct PageScript {
    /// `None` never reaches network idle.
    pub idle_after: Option<Duration>,
    /// Delay, from navigation start, before the page calls the trigger.
    pub trigger_after: Option<Duration>,
    pub meta: Option<String>,
    pub failure: Option<String>,
    pub animation_frames: usize,
    /// Frame whose advance call never returns.
    pub stall_animation_at: Option<usize>,
    pub screenshot_delay: Duration,
    pub sets_cookie: Option<(String, String)>,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            idle_after: Some(Duration::from_millis(50)),
            trigger_after: None,
            meta: None,
            failure: None,
            animation_frames: 3,
            stall_animation_at: None,
            screenshot_delay: Duration::ZERO,
            sets_cookie: None,
        }
    }
}

impl PageScript {
    pub fn idle_after(after: Duration) -> Self {
        Self {
            idle_after: Some(after),
            ..Default::default()
        }
    }

    pub fn never_idle() -> Self {
        Self {
            idle_after: None,
            ..Default::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_meta(mut self, content: &str) -> Self {
        self.meta = Some(content.to_string());
        self
    }

    pub fn trigger_after(mut self, after: Duration) -> Self {
        self.trigger_after = Some(after);
        self
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.animation_frames = frames;
        self
    }

    pub fn stall_animation_at(mut self, frame: usize) -> Self {
        self.stall_animation_at = Some(frame);
        self
    }

    pub fn slow_screenshot(mut self, delay: Duration) -> Self {
        self.screenshot_delay = delay;
        self
    }

    pub fn setting_cookie(mut self, name: &str, value: &str) -> Self {
        self.sets_cookie = Some((name.to_string(), value.to_string()));
        self
    }
}

#[derive(Default)]
struct FakeState {
    pages: Mutex<HashMap<String, PageScript>>,
    notifier: DisconnectNotifier,
    disconnected: AtomicBool,
    context_seq: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_closed: AtomicUsize,
    active_sessions: AtomicUsize,
    max_active_sessions: AtomicUsize,
    navigations: AtomicUsize,
    cleanup_delay: Mutex<Option<Duration>>,
    cleanup_fails: AtomicBool,
}

impl FakeState {
    fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(EngineError::Disconnected)
        } else {
            Ok(())
        }
    }
}

pub struct FakeEngine {
    state: Arc<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Self::with_pages(HashMap::new())
    }

    fn with_pages(pages: HashMap<String, PageScript>) -> Arc<Self> {
        let state = FakeState {
            pages: Mutex::new(pages),
            ..Default::default()
        };
        Arc::new(Self {
            state: Arc::new(state),
        })
    }

    /// Script the page served at `path`; unscripted paths use [`PageScript::default`].
    pub fn set_page(&self, path: &str, script: PageScript) {
        lock(&self.state.pages).insert(path.to_string(), script);
    }

    /// Simulate the engine process going away.
    pub fn disconnect(&self) {
        self.state.disconnected.store(true, Ordering::SeqCst);
        self.state.notifier.notify();
    }

    /// Make every cookie deletion stall, so context cleanup overruns its deadline.
    pub fn set_cleanup_delay(&self, delay: Option<Duration>) {
        *lock(&self.state.cleanup_delay) = delay;
    }

    /// Make every cookie deletion fail.
    pub fn set_cleanup_failure(&self, fails: bool) {
        self.state.cleanup_fails.store(fails, Ordering::SeqCst);
    }

    pub fn contexts_created(&self) -> usize {
        self.state.contexts_created.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.state.contexts_closed.load(Ordering::SeqCst)
    }

    pub fn open_contexts(&self) -> usize {
        self.contexts_created() - self.contexts_closed()
    }

    pub fn active_sessions(&self) -> usize {
        self.state.active_sessions.load(Ordering::SeqCst)
    }

    pub fn max_active_sessions(&self) -> usize {
        self.state.max_active_sessions.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> usize {
        self.state.navigations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderEngine for FakeEngine {
    fn disconnected(&self) -> DisconnectSignal {
        self.state.notifier.subscribe()
    }

    fn is_connected(&self) -> bool {
        !self.state.disconnected.load(Ordering::SeqCst)
    }

    async fn new_context(&self) -> Result<Box<dyn RenderContext>, EngineError> {
        self.state.ensure_connected()?;
        let seq = self.state.context_seq.fetch_add(1, Ordering::SeqCst);
        self.state.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeContext {
            id: format!("fake-context-{seq}"),
            state: self.state.clone(),
            jar: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.disconnect();
        Ok(())
    }
}

struct FakeContext {
    id: String,
    state: Arc<FakeState>,
    /// Shared by every session of this context, like a browser context's cookie store.
    jar: Arc<Mutex<Vec<Cookie>>>,
    closed: AtomicBool,
}

#[async_trait]
impl RenderContext for FakeContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn new_session(&self) -> Result<Box<dyn RenderSession>, EngineError> {
        self.state.ensure_connected()?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Protocol(format!("context {} is closed", self.id)));
        }
        let active = self.state.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_active_sessions.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(FakeSession {
            state: self.state.clone(),
            jar: self.jar.clone(),
            page: Mutex::new(SessionPage::default()),
            trigger: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.contexts_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Default)]
struct SessionPage {
    url: Option<Url>,
    script: PageScript,
    lang: Option<String>,
    timezone: Option<String>,
    viewport: Viewport,
    frame: usize,
}

struct FakeSession {
    state: Arc<FakeState>,
    jar: Arc<Mutex<Vec<Cookie>>>,
    page: Mutex<SessionPage>,
    trigger: Mutex<Option<CaptureTrigger>>,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.state.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

fn render_png(viewport: &Viewport, shade: u8) -> Result<Vec<u8>, EngineError> {
    let pixel = image::Rgba([shade, 0x80, 0xff - shade, 0xff]);
    let canvas = image::RgbaImage::from_pixel(viewport.width.max(1), viewport.height.max(1), pixel);
    let mut bytes = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(canvas)
        .write_to(&mut bytes, image::ImageOutputFormat::Png)
        .map_err(EngineError::protocol)?;
    Ok(bytes.into_inner())
}

#[async_trait]
impl RenderSession for FakeSession {
    async fn emulate_timezone(&self, timezone: &str) -> Result<(), EngineError> {
        lock(&self.page).timezone = Some(timezone.to_string());
        Ok(())
    }

    async fn emulate_locale(&self, lang: &str) -> Result<(), EngineError> {
        lock(&self.page).lang = Some(lang.to_string());
        Ok(())
    }

    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), EngineError> {
        lock(&self.page).viewport = viewport.clone();
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), EngineError> {
        self.state.ensure_connected()?;
        let mut jar = lock(&self.jar);
        for cookie in cookies {
            jar.retain(|c| c.name != cookie.name);
            jar.push(cookie.clone());
        }
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, EngineError> {
        self.state.ensure_connected()?;
        Ok(lock(&self.jar).clone())
    }

    async fn delete_cookies(&self, cookies: &[Cookie]) -> Result<(), EngineError> {
        let delay = *lock(&self.state.cleanup_delay);
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        self.state.ensure_connected()?;
        if self.state.cleanup_fails.load(Ordering::SeqCst) {
            return Err(EngineError::Protocol("Network.deleteCookies failed".into()));
        }
        lock(&self.jar).retain(|c| !cookies.iter().any(|d| d.name == c.name));
        Ok(())
    }

    async fn expose_trigger(
        &self,
        _name: &str,
        trigger: CaptureTrigger,
    ) -> Result<(), EngineError> {
        *lock(&self.trigger) = Some(trigger);
        Ok(())
    }

    async fn navigate(&self, url: &Url, timeout: Duration) -> Result<(), EngineError> {
        self.state.ensure_connected()?;
        self.state.navigations.fetch_add(1, Ordering::SeqCst);

        let script = lock(&self.state.pages)
            .get(url.path())
            .cloned()
            .unwrap_or_default();
        {
            let mut page = lock(&self.page);
            page.url = Some(url.clone());
            page.script = script.clone();
            page.frame = 0;
        }

        if let Some((name, value)) = &script.sets_cookie {
            lock(&self.jar).push(Cookie::for_url(name.as_str(), value.as_str(), url));
        }

        let trigger = lock(&self.trigger).clone();
        if let (Some(after), Some(trigger)) = (script.trigger_after, trigger) {
            tokio::spawn(async move {
                sleep(after).await;
                trigger.fire();
            });
        }

        if let Some(message) = script.failure {
            return Err(EngineError::Navigation(message));
        }

        match script.idle_after {
            Some(after) if after <= timeout => {
                sleep(after).await;
                self.state.ensure_connected()
            }
            _ => {
                sleep(timeout).await;
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    async fn meta_content(&self, name: &str) -> Result<Option<String>, EngineError> {
        self.state.ensure_connected()?;
        if name != CAPTURE_META {
            return Ok(None);
        }
        Ok(lock(&self.page).script.meta.clone())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, EngineError> {
        self.state.ensure_connected()?;
        let (delay, viewport, frame) = {
            let page = lock(&self.page);
            (page.script.screenshot_delay, page.viewport.clone(), page.frame)
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        render_png(&viewport, (frame * 40 % 256) as u8)
    }

    async fn print_pdf(&self, options: &PrintOptions) -> Result<Vec<u8>, EngineError> {
        self.state.ensure_connected()?;
        let page = lock(&self.page);
        let cookies = lock(&self.jar)
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join(";");
        let (width, height) = options.paper_size();

        let body = format!(
            "%PDF-1.4\n% url={}\n% cookies={}\n% lang={}\n% timezone={}\n% footer={}\n% paper={:.2}x{:.2}\n% landscape={}\n% ranges={}\n%%EOF\n",
            page.url.as_ref().map(Url::as_str).unwrap_or_default(),
            cookies,
            page.lang.as_deref().unwrap_or_default(),
            page.timezone.as_deref().unwrap_or_default(),
            options.footer.as_deref().unwrap_or("-"),
            width,
            height,
            options.landscape,
            options.page_ranges,
        );
        Ok(body.into_bytes())
    }

    async fn advance_animation(&self) -> Result<bool, EngineError> {
        self.state.ensure_connected()?;
        let (done, stalled) = {
            let mut page = lock(&self.page);
            page.frame += 1;
            (
                page.frame >= page.script.animation_frames,
                page.script.stall_animation_at == Some(page.frame),
            )
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(done)
    }

    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Launches [`FakeEngine`]s, optionally failing the next few attempts
#[derive(Default)]
pub struct FakeLauncher {
    pages: Mutex<HashMap<String, PageScript>>,
    engines: Mutex<Vec<Arc<FakeEngine>>>,
    launches: AtomicUsize,
    failures: AtomicUsize,
    launch_delay: Mutex<Duration>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script a page on the current engine and every engine launched later.
    pub fn set_page(&self, path: &str, script: PageScript) {
        lock(&self.pages).insert(path.to_string(), script.clone());
        for engine in lock(&self.engines).iter() {
            engine.set_page(path, script.clone());
        }
    }

    pub fn fail_next(&self, attempts: usize) {
        self.failures.store(attempts, Ordering::SeqCst);
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *lock(&self.launch_delay) = delay;
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Most recently launched engine.
    pub fn current(&self) -> Option<Arc<FakeEngine>> {
        lock(&self.engines).last().cloned()
    }
}

#[async_trait]
impl EngineLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn RenderEngine>, EngineError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.launch_delay);
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::Launch("simulated launch failure".to_string()));
        }

        let engine = FakeEngine::with_pages(lock(&self.pages).clone());
        lock(&self.engines).push(engine.clone());
        Ok(engine)
    }
}
