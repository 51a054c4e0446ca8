//! HTTP surface
//!
//! `GET /api/v1/screenshot` and `GET /api/v1/print` turn query parameters into
//! a [`CaptureRequest`]; `/health` and `/metrics` expose the service state.
//! Every failure is answered in plain text with the status from
//! [`CaptureError::status_code`].

use crate::engine::Cookie;
use crate::health::{HealthChecker, HealthLevel};
use crate::print::{CssLength, Margins, PaperFormat, PrintOptions};
use crate::utils::attachment_disposition;
use crate::{
    CaptureError, CaptureRequest, CaptureResult, CaptureService, FairnessKey, OutputKind, Viewport,
};
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use url::Url;

/// Identifies the caller of a capture endpoint
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `None` when the request carries no recognizable identity.
    async fn identify(&self, headers: &HeaderMap) -> Option<String>;
}

/// Trusts an identity header set by an authenticating reverse proxy
#[derive(Debug, Clone)]
pub struct TrustedHeader {
    header: String,
}

impl TrustedHeader {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

#[async_trait]
impl Authenticator for TrustedHeader {
    async fn identify(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(self.header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|identity| !identity.is_empty())
            .map(str::to_string)
    }
}

#[derive(Clone)]
pub struct AppState {
    service: Arc<CaptureService>,
    health: Arc<HealthChecker>,
    authenticator: Option<Arc<dyn Authenticator>>,
    prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(service: Arc<CaptureService>, health: Arc<HealthChecker>) -> Self {
        Self {
            service,
            health,
            authenticator: None,
            prometheus: None,
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Identity of an authorized caller, if it has one.
    ///
    /// Without an authenticator every caller is let through. With one, an
    /// unidentified caller must present the shared capture secret.
    async fn authorize(
        &self,
        headers: &HeaderMap,
        key: Option<&str>,
    ) -> Result<Option<String>, CaptureError> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(None);
        };
        if let Some(identity) = authenticator.identify(headers).await {
            return Ok(Some(identity));
        }
        match (self.service.config().capture_secret.as_deref(), key) {
            (Some(secret), Some(key)) if !secret.is_empty() && secret == key => Ok(None),
            _ => Err(CaptureError::Auth),
        }
    }
}

pub fn router(state: AppState) -> Router {
    if state.authenticator.is_none() {
        warn!("No authenticator configured, capture endpoints accept every caller");
    }

    Router::new()
        .route("/api/v1/screenshot", get(screenshot))
        .route("/api/v1/print", get(print))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then stop accepting and finish open responses.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!("{} ({:?})", self, self.severity());
        } else {
            debug!("rejected capture: {}", self);
        }
        (status, self.public_message()).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotQuery {
    pub target: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub lang: Option<String>,
    pub timezone: Option<String>,
    pub filename: Option<String>,
    pub concurrency_key: Option<String>,
    pub key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintQuery {
    pub target: Option<String>,
    pub landscape: Option<String>,
    pub footer: Option<String>,
    pub format: Option<String>,
    pub left: Option<String>,
    pub right: Option<String>,
    pub top: Option<String>,
    pub bottom: Option<String>,
    pub page_ranges: Option<String>,
    pub lang: Option<String>,
    pub timezone: Option<String>,
    pub filename: Option<String>,
    pub concurrency_key: Option<String>,
    pub key: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn required_target(target: Option<&str>) -> Result<&str, CaptureError> {
    non_empty(target).ok_or_else(|| CaptureError::validation("parameter \"target\" is required"))
}

fn parse_dimension(name: &str, raw: Option<&str>, default: u32) -> Result<u32, CaptureError> {
    match non_empty(raw) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| CaptureError::validation(format!("{name} must be a positive integer"))),
    }
}

fn parse_margin(raw: Option<&str>, default: CssLength) -> Result<CssLength, CaptureError> {
    non_empty(raw).map(str::parse::<CssLength>).transpose().map(|m| m.unwrap_or(default))
}

/// `footer=true` prints the page counter alone; any other value is also the label.
fn footer_label(raw: Option<&str>) -> Option<String> {
    match raw {
        None | Some("") => None,
        Some("true") => Some(String::new()),
        Some(label) => Some(label.to_string()),
    }
}

impl PrintQuery {
    pub fn print_options(&self) -> Result<PrintOptions, CaptureError> {
        let defaults = Margins::default();
        Ok(PrintOptions {
            landscape: self.landscape.as_deref() == Some("true"),
            footer: footer_label(self.footer.as_deref()),
            format: non_empty(self.format.as_deref())
                .map(str::parse::<PaperFormat>)
                .transpose()?
                .unwrap_or_default(),
            margins: Margins {
                top: parse_margin(self.top.as_deref(), defaults.top)?,
                right: parse_margin(self.right.as_deref(), defaults.right)?,
                bottom: parse_margin(self.bottom.as_deref(), defaults.bottom)?,
                left: parse_margin(self.left.as_deref(), defaults.left)?,
            },
            page_ranges: self.page_ranges.clone().unwrap_or_default(),
        })
    }
}

/// Every inbound cookie, scoped to the target. The service decides whether
/// the target host may receive them.
fn inbound_cookies(jar: &CookieJar, target: &Url) -> Vec<Cookie> {
    jar.iter()
        .map(|cookie| Cookie::for_url(cookie.name(), cookie.value(), target))
        .collect()
}

fn capture_response(result: CaptureResult, filename: Option<&str>) -> Response {
    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, result.mime)],
        result.data,
    )
        .into_response();
    if let Some(filename) = non_empty(filename) {
        if let Ok(value) = HeaderValue::from_str(&attachment_disposition(filename)) {
            response.headers_mut().insert(header::CONTENT_DISPOSITION, value);
        }
    }
    response
}

async fn screenshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<ScreenshotQuery>,
) -> Result<Response, CaptureError> {
    let identity = state.authorize(&headers, query.key.as_deref()).await?;
    let target = required_target(query.target.as_deref())?;
    let output = OutputKind::screenshot(query.kind.as_deref(), query.filename.as_deref())?;

    let mut request = CaptureRequest::new(target, output)?;
    let defaults = &state.service.config().default_viewport;
    request.viewport = Some(Viewport {
        width: parse_dimension("width", query.width.as_deref(), defaults.width)?,
        height: parse_dimension("height", query.height.as_deref(), defaults.height)?,
        ..defaults.clone()
    });
    request.lang = query.lang;
    request.timezone = query.timezone;
    request.fairness_key =
        FairnessKey::resolve(query.concurrency_key.as_deref(), identity.as_deref());
    request.cookies = inbound_cookies(&jar, &request.target);

    let result = state.service.capture(request).await?;
    Ok(capture_response(result, query.filename.as_deref()))
}

async fn print(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Query(query): Query<PrintQuery>,
) -> Result<Response, CaptureError> {
    let identity = state.authorize(&headers, query.key.as_deref()).await?;
    let target = required_target(query.target.as_deref())?;
    let options = query.print_options()?;

    let mut request = CaptureRequest::new(target, OutputKind::Pdf(options))?;
    request.lang = query.lang.clone();
    request.timezone = query.timezone.clone();
    request.fairness_key =
        FairnessKey::resolve(query.concurrency_key.as_deref(), identity.as_deref());
    request.cookies = inbound_cookies(&jar, &request.target);

    let result = state.service.capture(request).await?;
    Ok(capture_response(result, query.filename.as_deref()))
}

async fn health(State(state): State<AppState>) -> Response {
    let status = state.health.check().await;
    let code = if status.overall == HealthLevel::Critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(status)).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed").into_response(),
    }
}
