//! Capture orchestration
//!
//! Runs one [`CaptureRequest`] end to end: admission, context lease, session
//! setup, readiness, the capture call itself, and the unconditional cleanup
//! that decides whether the context may be reused.

use crate::admission::AdmissionQueue;
use crate::animation::{capture_animation, AnimationSettings};
use crate::engine::{Cookie, EngineLauncher, RenderSession};
use crate::pool::{ContextLease, ContextPool, PoolStats};
use crate::postprocess::{png_to_jpeg, FrameCompressor, JPEG_QUALITY};
use crate::readiness::{PageReadiness, ReadinessOutcome, ReadinessSettings};
use crate::supervisor::{EngineListener, Supervisor};
use crate::utils::host_of;
use crate::{
    CaptureError, CaptureRequest, CaptureResult, Config, EngineError, ImageFormat, Metrics,
    OutputKind,
};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

/// The capture pipeline shared by every request handler
///
/// # Examples
///
/// ```rust,no_run
/// use capture_service::{CaptureRequest, CaptureService, Config, ImageFormat, Metrics, OutputKind};
/// use capture_service::engine::chromium::ChromiumLauncher;
/// use capture_service::postprocess::Passthrough;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let launcher = Arc::new(ChromiumLauncher::new(&config));
///     let service = CaptureService::start(config, launcher, Arc::new(Passthrough), Arc::new(Metrics::new())).await?;
///
///     let request = CaptureRequest::new("https://example.com", OutputKind::Image(ImageFormat::Png))?;
///     let result = service.capture(request).await?;
///     println!("Captured {} bytes", result.data.len());
///
///     service.shutdown(std::time::Duration::from_secs(5)).await;
///     Ok(())
/// }
/// ```
pub struct CaptureService {
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
    pool: Arc<ContextPool>,
    admission: Arc<AdmissionQueue>,
    compressor: Arc<dyn FrameCompressor>,
    metrics: Arc<Metrics>,
}

impl CaptureService {
    /// Validate the configuration, launch the engine and warm the pool.
    pub async fn start(
        config: Config,
        launcher: Arc<dyn EngineLauncher>,
        compressor: Arc<dyn FrameCompressor>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, CaptureError> {
        config.validate()?;

        let supervisor = Supervisor::new(launcher, metrics.clone());
        let pool = ContextPool::new(
            supervisor.handle(),
            config.concurrency,
            config.min_contexts,
            metrics.clone(),
        );
        let listener: Arc<dyn EngineListener> = pool.clone();
        supervisor.subscribe(Arc::downgrade(&listener));
        supervisor.start().await?;

        info!(
            "Capture service ready: concurrency {}, timeout {:?}",
            config.concurrency, config.screenshot_timeout
        );

        Ok(Arc::new(Self {
            admission: AdmissionQueue::new(config.concurrency),
            config: Arc::new(config),
            supervisor,
            pool,
            compressor,
            metrics,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn pool(&self) -> &Arc<ContextPool> {
        &self.pool
    }

    pub fn queue_size(&self) -> usize {
        self.admission.size()
    }

    /// Whether inbound cookies may be forwarded to `target`.
    pub fn cookies_allowed(&self, target: &Url) -> bool {
        let Some(host) = host_of(target) else {
            return false;
        };
        self.config
            .public_host()
            .into_iter()
            .chain(self.config.cookie_hosts.iter().cloned())
            .any(|allowed| allowed.eq_ignore_ascii_case(&host))
    }

    /// Reject cross-host targets when the service is restricted to its own host.
    pub fn check_target(&self, target: &Url) -> Result<(), CaptureError> {
        if !self.config.only_same_host {
            return Ok(());
        }
        let same_host = match (host_of(target), self.config.public_host()) {
            (Some(target_host), Some(public)) => target_host.eq_ignore_ascii_case(&public),
            _ => false,
        };
        if same_host {
            Ok(())
        } else {
            Err(CaptureError::validation(format!(
                "Only targets on {} can be captured",
                self.config.public_url
            )))
        }
    }

    pub async fn capture(&self, request: CaptureRequest) -> Result<CaptureResult, CaptureError> {
        let span = info_span!(
            "capture",
            request_id = %request.id,
            target = %request.target,
            kind = request.output.label()
        );
        self.capture_inner(request).instrument(span).await
    }

    async fn capture_inner(&self, request: CaptureRequest) -> Result<CaptureResult, CaptureError> {
        request.validate(&self.config)?;
        self.check_target(&request.target)?;

        let started = Instant::now();
        let outcome = self.run(&request).await;
        let duration = started.elapsed();
        self.metrics
            .record_capture(request.output.label(), duration, outcome.is_ok());

        match outcome {
            Ok((data, readiness)) => {
                info!(
                    "{} capture of {} took {:?} ({} bytes)",
                    request.output.label(),
                    request.target,
                    duration,
                    data.len()
                );
                Ok(CaptureResult {
                    request_id: request.id.clone(),
                    target: request.target.to_string(),
                    data,
                    mime: request.output.mime(),
                    captured_at: chrono::Utc::now(),
                    duration,
                    readiness,
                })
            }
            Err(e) => {
                self.metrics.record_error(&e);
                warn!("capture of {} failed after {:?}: {}", request.target, duration, e);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &CaptureRequest,
    ) -> Result<(Vec<u8>, ReadinessOutcome), CaptureError> {
        self.metrics.set_queue_size(self.admission.size() + 1);
        let admitted = self
            .admission
            .admit(request.fairness_key.clone(), self.config.queue_timeout)
            .await;
        self.metrics.set_queue_size(self.admission.size());
        let _permit = admitted?;
        self.metrics.set_running(self.admission.running());

        let lease = self.pool.acquire(self.config.acquire_timeout).await?;
        let session = match lease.context().new_session().await {
            Ok(session) => session,
            Err(e) => {
                self.pool.destroy(lease).await;
                return Err(e.into());
            }
        };

        let outcome = self.drive(session.as_ref(), request).await;
        self.cleanup(lease, session, &request.cookies).await;
        outcome
    }

    /// Everything between session creation and cleanup.
    async fn drive(
        &self,
        session: &dyn RenderSession,
        request: &CaptureRequest,
    ) -> Result<(Vec<u8>, ReadinessOutcome), CaptureError> {
        let limit = request.effective_timeout(&self.config);

        session
            .emulate_timezone(request.effective_timezone(&self.config))
            .await?;
        session.emulate_locale(request.effective_lang(&self.config)).await?;

        if !request.cookies.is_empty() {
            if self.cookies_allowed(&request.target) {
                session.set_cookies(&request.cookies).await?;
            } else {
                debug!("withholding {} cookies from {}", request.cookies.len(), request.target);
            }
        }

        if !matches!(request.output, OutputKind::Pdf(_)) {
            let viewport = request
                .viewport
                .as_ref()
                .unwrap_or(&self.config.default_viewport);
            session.set_viewport(viewport).await?;
        }

        let settings = ReadinessSettings {
            timeout: limit,
            safety_delay: self.config.safety_delay,
        };
        let readiness = PageReadiness::new(session, &request.target, settings).run().await?;
        if readiness.timed_out() {
            self.metrics.record_soft_failure(&CaptureError::NavigationTimeout(limit));
        }

        let data = match &request.output {
            OutputKind::Image(format) => {
                let png = bounded(limit, session.screenshot()).await?;
                match format {
                    ImageFormat::Png => png,
                    ImageFormat::Jpeg => {
                        tokio::task::spawn_blocking(move || png_to_jpeg(&png, JPEG_QUALITY))
                            .await
                            .map_err(|e| CaptureError::Encoding(e.to_string()))??
                    }
                }
            }
            OutputKind::Pdf(options) => bounded(limit, session.print_pdf(options)).await?,
            OutputKind::Animation => {
                let settings = AnimationSettings {
                    max_frames: self.config.max_animation_frames,
                    frame_rate: self.config.animation_frame_rate,
                    frame_timeout: limit,
                };
                capture_animation(session, settings, self.compressor.as_ref()).await?
            }
        };
        Ok((data, readiness))
    }

    /// Clear per-request state, then release the context, or destroy it if
    /// cleanup failed or overran its deadline. An overrunning cleanup is
    /// cancelled, never left running against a destroyed context.
    async fn cleanup(
        &self,
        lease: ContextLease,
        session: Box<dyn RenderSession>,
        passed: &[Cookie],
    ) {
        let cleaned = timeout(
            self.config.cleanup_timeout,
            clear_session(session.as_ref(), passed),
        )
        .await;
        drop(session);

        let failure = match cleaned {
            Ok(Ok(())) => return self.pool.release(lease).await,
            Ok(Err(e)) => CaptureError::CleanupFailure(e.to_string()),
            Err(_) => {
                let limit = self.config.cleanup_timeout;
                CaptureError::CleanupFailure(format!("exceeded {limit:?}"))
            }
        };
        warn!("context {} destroyed: {}", lease.id(), failure);
        self.metrics.record_soft_failure(&failure);
        self.pool.destroy(lease).await;
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            pool: self.pool.stats().await,
            queued: self.admission.size(),
            running: self.admission.running(),
            engine_running: self.supervisor.is_running(),
            engine_restarts: self.supervisor.restart_count(),
        }
    }

    /// Stop admitting, let in-flight captures finish within `grace`, then
    /// destroy every context and close the engine.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down capture service...");
        self.admission.close();
        self.supervisor.mark_closing();
        self.pool.drain(grace).await;
        self.supervisor.stop().await;
        info!("Capture service shutdown complete");
    }
}

/// Race an engine call against the capture deadline; losing is fatal.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, CaptureError> {
    match timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(CaptureError::CaptureTimeout(limit)),
    }
}

async fn clear_session(session: &dyn RenderSession, passed: &[Cookie]) -> Result<(), CaptureError> {
    if !passed.is_empty() {
        session.delete_cookies(passed).await?;
    }
    let remaining = session.cookies().await?;
    if !remaining.is_empty() {
        session.delete_cookies(&remaining).await?;
    }
    session.close().await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ServiceStats {
    pub pool: PoolStats,
    pub queued: usize,
    pub running: usize,
    pub engine_running: bool,
    pub engine_restarts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::PageScript;
    use crate::print::PrintOptions;
    use crate::tests::{page_url, service_with};

    fn config() -> Config {
        Config {
            concurrency: 2,
            ..Default::default()
        }
    }

    fn pdf_request(path: &str) -> CaptureRequest {
        CaptureRequest::new(&page_url(path), OutputKind::Pdf(PrintOptions::default())).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_context_has_no_cookies() {
        let (service, launcher) = service_with(config()).await;
        launcher.set_page("/login.html", PageScript::default().setting_cookie("session", "abc"));

        let mut request = pdf_request("/login.html");
        request.cookies = vec![Cookie::for_url("id_token", "one", &request.target)];
        let result = service.capture(request).await.unwrap();
        let text = String::from_utf8_lossy(&result.data).to_string();
        assert!(text.contains("id_token=one"));
        assert!(text.contains("session=abc"));

        // same context, no cookies of its own
        let result = service.capture(pdf_request("/plain.html")).await.unwrap();
        assert!(String::from_utf8_lossy(&result.data).contains("% cookies=\n"));
        let stats = service.stats().await;
        assert_eq!(stats.pool.created, 1);
        assert_eq!(stats.pool.destroyed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cookies_withheld_from_other_hosts() {
        let (service, _launcher) = service_with(config()).await;
        let mut request = CaptureRequest::new(
            "https://elsewhere.example/page.html",
            OutputKind::Pdf(PrintOptions::default()),
        )
        .unwrap();
        request.cookies = vec![Cookie::for_url("id_token", "secret", &request.target)];

        let result = service.capture(request).await.unwrap();
        assert!(!String::from_utf8_lossy(&result.data).contains("secret"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_same_host_rejects_before_acquiring() {
        let (service, launcher) = service_with(Config {
            only_same_host: true,
            ..config()
        })
        .await;
        let request = CaptureRequest::new(
            "https://elsewhere.example/",
            OutputKind::Image(ImageFormat::Png),
        )
        .unwrap();
        let err = service.capture(request).await.unwrap_err();
        assert!(matches!(err, CaptureError::Validation(_)));
        assert_eq!(launcher.current().unwrap().navigations(), 0);

        assert!(service.capture(pdf_request("/ok.html")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cleanup_destroys_context() {
        let (service, launcher) = service_with(config()).await;
        launcher.set_page("/login.html", PageScript::default().setting_cookie("session", "abc"));
        let engine = launcher.current().unwrap();
        engine.set_cleanup_delay(Some(Duration::from_secs(5)));

        let result = service.capture(pdf_request("/login.html")).await;
        assert!(result.is_ok(), "cleanup failures never reach the caller");

        let stats = service.stats().await;
        assert_eq!(stats.pool.destroyed, 1);
        assert_eq!(stats.pool.in_use, 0);
        assert_eq!(engine.open_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cleanup_destroys_context() {
        let (service, launcher) = service_with(config()).await;
        let engine = launcher.current().unwrap();
        engine.set_cleanup_failure(true);

        let mut request = pdf_request("/page.html");
        request.cookies = vec![Cookie::for_url("id_token", "secret", &request.target)];
        let result = service.capture(request).await;
        assert!(result.is_ok(), "cleanup failures never reach the caller");

        let stats = service.stats().await;
        assert_eq!(stats.pool.destroyed, 1);
        assert_eq!(stats.pool.in_use, 0);
        assert_eq!(engine.open_contexts(), 0);

        engine.set_cleanup_failure(false);
        service.capture(pdf_request("/page.html")).await.unwrap();
        assert_eq!(service.stats().await.pool.destroyed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_timeout_is_fatal_and_cleaned_up() {
        let (service, launcher) = service_with(config()).await;
        launcher.set_page(
            "/heavy.html",
            PageScript::default().slow_screenshot(Duration::from_secs(60)),
        );

        let request = CaptureRequest::new(
            &page_url("/heavy.html"),
            OutputKind::Image(ImageFormat::Png),
        )
        .unwrap();
        let err = service.capture(request).await.unwrap_err();
        assert!(matches!(err, CaptureError::CaptureTimeout(_)));
        assert_eq!(err.status_code(), 504);

        let stats = service.stats().await;
        assert_eq!(stats.pool.in_use, 0);
        assert_eq!(stats.running, 0);
        assert_eq!(launcher.current().unwrap().active_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jpeg_output() {
        let (service, _launcher) = service_with(config()).await;
        let request = CaptureRequest::new(
            &page_url("/page.html"),
            OutputKind::Image(ImageFormat::Jpeg),
        )
        .unwrap();
        let result = service.capture(request).await.unwrap();
        assert_eq!(result.mime, "image/jpeg");
        assert_eq!(&result.data[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_animation_output() {
        let (service, launcher) = service_with(config()).await;
        launcher.set_page("/anim.html", PageScript::default().with_frames(3));
        let mut request =
            CaptureRequest::new(&page_url("/anim.html"), OutputKind::Animation).unwrap();
        request.viewport = Some(crate::Viewport {
            width: 32,
            height: 24,
            ..Default::default()
        });

        let result = service.capture(request).await.unwrap();
        assert_eq!(result.mime, "image/gif");
        assert_eq!(&result.data[..6], b"GIF89a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_locale_defaults_and_overrides() {
        let (service, _launcher) = service_with(config()).await;
        let result = service.capture(pdf_request("/page.html")).await.unwrap();
        let text = String::from_utf8_lossy(&result.data).to_string();
        assert!(text.contains("% lang=fr-FR"));
        assert!(text.contains("% timezone=Europe/Paris"));

        let mut request = pdf_request("/page.html");
        request.lang = Some("es".to_string());
        request.timezone = Some("America/New_York".to_string());
        let result = service.capture(request).await.unwrap();
        let text = String::from_utf8_lossy(&result.data).to_string();
        assert!(text.contains("% lang=es"));
        assert!(text.contains("% timezone=America/New_York"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_failure_releases_clean_context() {
        let (service, launcher) = service_with(config()).await;
        launcher.set_page("/broken.html", PageScript::failing("net::ERR_CONNECTION_REFUSED"));

        let err = service.capture(pdf_request("/broken.html")).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        let stats = service.stats().await;
        assert_eq!(stats.pool.in_use, 0);
        assert_eq!(stats.pool.destroyed, 0);
    }
}
