//! Chromium engine over the DevTools protocol
//!
//! One headless Chromium process per engine generation. Each render context is
//! an incognito browser context, each session a page (target) inside it.

use super::{
    Cookie, DisconnectNotifier, DisconnectSignal, EngineLauncher, RenderContext, RenderEngine,
    RenderSession,
};
use crate::print::PrintOptions;
use crate::readiness::CaptureTrigger;
use crate::{Config, EngineError, Viewport};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{BrowserContextId, CloseParams};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetLocaleOverrideParams, SetTimezoneOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, DeleteCookiesParams, Headers, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, EventLifecycleEvent,
    NavigateParams, PrintToPdfParams, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::storage::GetCookiesParams;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{AddBindingParams, EventBindingCalled};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

/// Generate Chrome command-line arguments for one engine generation
///
/// Each generation gets its own profile and temp directories so a relaunch
/// never trips over the singleton lock of a process that is still exiting.
///
/// # Examples
///
/// ```rust
/// use capture_service::Config;
/// use capture_service::engine::chromium::chrome_args;
///
/// let args = chrome_args(&Config::default(), 0);
/// assert!(args.iter().any(|a| a == "--headless"));
/// ```
pub fn chrome_args(config: &Config, generation: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), generation);

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--font-render-hinting=none".to_string(),
        format!(
            "--window-size={},{}",
            config.default_viewport.width, config.default_viewport.height
        ),
        format!("--user-data-dir=/tmp/capture-service-profile-{unique_id}"),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

/// `navigator.languages` as a browser configured for `lang` would report them.
pub fn navigator_languages(lang: &str) -> Vec<String> {
    let mut languages = vec![lang.to_string()];
    if let Some((primary, _)) = lang.split_once('-') {
        languages.push(primary.to_string());
    }
    languages
}

/// `Accept-Language` header value for `lang`.
pub fn accept_language(lang: &str) -> String {
    navigator_languages(lang)
        .iter()
        .enumerate()
        .map(|(i, l)| if i == 0 { l.clone() } else { format!("{l};q=0.9") })
        .collect::<Vec<_>>()
        .join(",")
}

fn locale_script(lang: &str) -> String {
    let languages =
        serde_json::to_string(&navigator_languages(lang)).unwrap_or_else(|_| "[]".into());
    format!(
        "(() => {{
  const languages = {languages};
  Object.defineProperty(navigator, 'language', {{ get: () => languages[0] }});
  Object.defineProperty(navigator, 'languages', {{ get: () => languages }});
}})();"
    )
}

fn binding_name(function: &str) -> String {
    format!("__{function}Binding")
}

fn trigger_script(function: &str) -> String {
    format!(
        "window.{function} = (...args) => window.{binding}(JSON.stringify(args));",
        binding = binding_name(function)
    )
}

/// `Page.printToPDF` parameters. The paper is always given in portrait;
/// Chrome turns it when `landscape` is set.
fn pdf_params(options: &PrintOptions) -> PrintToPdfParams {
    let (paper_width, paper_height) = options.paper_size();
    let margins = &options.margins;
    let footer = options.footer_template();

    PrintToPdfParams {
        landscape: Some(options.landscape),
        print_background: Some(true),
        paper_width: Some(paper_width),
        paper_height: Some(paper_height),
        margin_top: Some(margins.top.inches()),
        margin_right: Some(margins.right.inches()),
        margin_bottom: Some(margins.bottom.inches()),
        margin_left: Some(margins.left.inches()),
        page_ranges: Some(options.page_ranges.clone()).filter(|r| !r.is_empty()),
        display_header_footer: Some(footer.is_some()),
        header_template: footer.as_ref().map(|_| "<span></span>".to_string()),
        footer_template: footer,
        ..Default::default()
    }
}

pub struct ChromiumLauncher {
    config: Config,
    generation: AtomicUsize,
}

impl ChromiumLauncher {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            generation: AtomicUsize::new(0),
        }
    }

    fn browser_config(&self, generation: usize) -> Result<BrowserConfig, EngineError> {
        let viewport = &self.config.default_viewport;
        let mut builder = BrowserConfig::builder()
            .window_size(viewport.width, viewport.height)
            .request_timeout(self.config.screenshot_timeout + Duration::from_secs(10))
            .args(chrome_args(&self.config, generation));

        if let Some(chrome_path) = &self.config.chrome_path {
            builder = builder.chrome_executable(chrome_path);
        }

        builder.build().map_err(EngineError::Launch)
    }
}

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn RenderEngine>, EngineError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let browser_config = self.browser_config(generation)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| EngineError::Launch(e.to_string()))?;

        let notifier = Arc::new(DisconnectNotifier::new());
        let handler_notifier = notifier.clone();
        // the handler drives all DevTools traffic and must be polled continuously
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!("DevTools handler error: {}", e);
                    break;
                }
            }
            info!("DevTools handler stream ended");
            handler_notifier.notify();
        });

        info!(generation, "Chromium launched");
        Ok(Arc::new(ChromiumEngine {
            browser: Arc::new(browser),
            notifier,
            handler_task,
            user_agent: self.config.user_agent.clone(),
        }))
    }
}

pub struct ChromiumEngine {
    browser: Arc<Browser>,
    notifier: Arc<DisconnectNotifier>,
    handler_task: JoinHandle<()>,
    user_agent: Option<String>,
}

impl Drop for ChromiumEngine {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

#[async_trait]
impl RenderEngine for ChromiumEngine {
    fn disconnected(&self) -> DisconnectSignal {
        self.notifier.subscribe()
    }

    fn is_connected(&self) -> bool {
        !self.notifier.is_disconnected() && !self.handler_task.is_finished()
    }

    async fn new_context(&self) -> Result<Box<dyn RenderContext>, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::Disconnected);
        }
        let created = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
            .map_err(EngineError::protocol)?;
        let context_id = created.result.browser_context_id.clone();

        Ok(Box::new(ChromiumContext {
            id: context_id.inner().clone(),
            context_id,
            browser: self.browser.clone(),
            user_agent: self.user_agent.clone(),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        let result = self.browser.execute(CloseParams::default()).await;
        self.handler_task.abort();
        self.notifier.notify();
        result.map(|_| ()).map_err(EngineError::protocol)
    }
}

struct ChromiumContext {
    id: String,
    context_id: BrowserContextId,
    browser: Arc<Browser>,
    user_agent: Option<String>,
}

#[async_trait]
impl RenderContext for ChromiumContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn new_session(&self) -> Result<Box<dyn RenderSession>, EngineError> {
        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = Some(self.context_id.clone());
        let page = self.browser.new_page(target).await.map_err(EngineError::protocol)?;

        page.execute(SetLifecycleEventsEnabledParams::new(true))
            .await
            .map_err(EngineError::protocol)?;
        if let Some(user_agent) = &self.user_agent {
            page.set_user_agent(user_agent.as_str())
                .await
                .map_err(EngineError::protocol)?;
        }

        Ok(Box::new(ChromiumSession {
            page,
            browser: self.browser.clone(),
            context_id: self.context_id.clone(),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.browser
            .execute(DisposeBrowserContextParams::new(self.context_id.clone()))
            .await
            .map_err(EngineError::protocol)?;
        Ok(())
    }
}

struct ChromiumSession {
    page: Page,
    browser: Arc<Browser>,
    context_id: BrowserContextId,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        for listener in self.listeners.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            listener.abort();
        }
    }
}

impl ChromiumSession {
    async fn add_script(&self, source: String) -> Result<(), EngineError> {
        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(source))
            .await
            .map_err(EngineError::protocol)?;
        Ok(())
    }

    async fn evaluate_json(
        &self,
        expression: String,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        let result = self
            .page
            .evaluate(expression)
            .await
            .map_err(EngineError::protocol)?;
        Ok(result.value().cloned())
    }
}

#[async_trait]
impl RenderSession for ChromiumSession {
    async fn emulate_timezone(&self, timezone: &str) -> Result<(), EngineError> {
        self.page
            .execute(SetTimezoneOverrideParams::new(timezone))
            .await
            .map_err(EngineError::protocol)?;
        Ok(())
    }

    async fn emulate_locale(&self, lang: &str) -> Result<(), EngineError> {
        let headers = Headers::new(serde_json::json!({ "Accept-Language": accept_language(lang) }));
        self.page
            .execute(SetExtraHttpHeadersParams::new(headers))
            .await
            .map_err(EngineError::protocol)?;

        let locale = SetLocaleOverrideParams {
            locale: Some(lang.to_string()),
        };
        if let Err(e) = self.page.execute(locale).await {
            debug!("locale override {} rejected: {}", lang, e);
        }

        self.add_script(locale_script(lang)).await
    }

    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), EngineError> {
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width as i64)
            .height(viewport.height as i64)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(EngineError::Protocol)?;
        self.page.execute(metrics).await.map_err(EngineError::protocol)?;
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<(), EngineError> {
        let params = cookies
            .iter()
            .map(|cookie| {
                let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
                param.url = cookie.url.clone();
                param.domain = cookie.domain.clone();
                param.path = cookie.path.clone();
                param
            })
            .collect();
        self.page.set_cookies(params).await.map_err(EngineError::protocol)?;
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, EngineError> {
        let params = GetCookiesParams {
            browser_context_id: Some(self.context_id.clone()),
        };
        let response = self.browser.execute(params).await.map_err(EngineError::protocol)?;
        Ok(response
            .result
            .cookies
            .iter()
            .map(|c| Cookie {
                name: c.name.clone(),
                value: c.value.clone(),
                url: None,
                domain: Some(c.domain.clone()),
                path: Some(c.path.clone()),
            })
            .collect())
    }

    async fn delete_cookies(&self, cookies: &[Cookie]) -> Result<(), EngineError> {
        let params = cookies
            .iter()
            .map(|cookie| {
                let mut param = DeleteCookiesParams::new(cookie.name.clone());
                param.url = cookie.url.clone();
                param.domain = cookie.domain.clone();
                param.path = cookie.path.clone();
                param
            })
            .collect();
        self.page.delete_cookies(params).await.map_err(EngineError::protocol)?;
        Ok(())
    }

    async fn expose_trigger(&self, name: &str, trigger: CaptureTrigger) -> Result<(), EngineError> {
        let binding = binding_name(name);
        let mut calls = self
            .page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(EngineError::protocol)?;
        self.page
            .execute(AddBindingParams::new(binding.clone()))
            .await
            .map_err(EngineError::protocol)?;
        self.add_script(trigger_script(name)).await?;

        let listener = tokio::spawn(async move {
            while let Some(call) = calls.next().await {
                if call.name == binding {
                    trigger.fire();
                    break;
                }
            }
        });
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
        Ok(())
    }

    async fn navigate(&self, url: &Url, limit: Duration) -> Result<(), EngineError> {
        let mut lifecycle = self
            .page
            .event_listener::<EventLifecycleEvent>()
            .await
            .map_err(EngineError::protocol)?;

        let navigation = async {
            let response = self
                .page
                .execute(NavigateParams::new(url.as_str()))
                .await
                .map_err(EngineError::protocol)?;
            let navigated = response.result;
            if let Some(error) = navigated.error_text.filter(|e| !e.is_empty()) {
                return Err(EngineError::Navigation(format!("{error} at {url}")));
            }

            while let Some(event) = lifecycle.next().await {
                let same_document = navigated
                    .loader_id
                    .as_ref()
                    .map_or(true, |loader| *loader == event.loader_id);
                if event.name == "networkIdle"
                    && event.frame_id == navigated.frame_id
                    && same_document
                {
                    return Ok(());
                }
            }
            Err(EngineError::Disconnected)
        };

        timeout(limit, navigation)
            .await
            .unwrap_or(Err(EngineError::Timeout(limit)))
    }

    async fn meta_content(&self, name: &str) -> Result<Option<String>, EngineError> {
        let selector = serde_json::to_string(&format!("head > meta[name='{name}']"))
            .map_err(EngineError::protocol)?;
        let expression = format!(
            "(() => {{ const meta = document.querySelector({selector}); return meta ? meta.getAttribute('content') : null; }})()"
        );
        Ok(self
            .evaluate_json(expression)
            .await?
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, EngineError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .build();
        self.page.screenshot(params).await.map_err(EngineError::protocol)
    }

    async fn print_pdf(&self, options: &PrintOptions) -> Result<Vec<u8>, EngineError> {
        self.page
            .pdf(pdf_params(options))
            .await
            .map_err(EngineError::protocol)
    }

    async fn advance_animation(&self) -> Result<bool, EngineError> {
        let stopped = self
            .evaluate_json("window.animateCaptureFrame()".to_string())
            .await?;
        Ok(stopped.and_then(|v| v.as_bool()).unwrap_or(true))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.page.clone().close().await.map_err(EngineError::protocol)
    }
}
