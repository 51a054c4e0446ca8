//! Configuration management with serde serialization/deserialization
//!
//! This module provides the service configuration along with the request and
//! result types exchanged with the capture orchestrator.

use crate::engine::Cookie;
use crate::print::PrintOptions;
use crate::utils::{extract_host, validate_url};
use crate::CaptureError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Main configuration structure for the capture service
///
/// Controls concurrency, the individual stage timeouts, request bounds and the
/// defaults applied to requests that don't specify a locale or viewport.
///
/// # Examples
///
/// ```rust
/// use capture_service::Config;
///
/// let config = Config {
///     concurrency: 8,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen port (default: 5607)
    pub port: u16,

    /// Public URL the service is reached at (default: http://localhost:5607)
    ///
    /// Inbound cookies are only forwarded to targets on this host.
    pub public_url: String,

    /// Reject every target that is not on the public host (default: false)
    pub only_same_host: bool,

    /// Additional hosts trusted to receive the caller's cookies
    pub cookie_hosts: Vec<String>,

    /// Maximum number of captures running at once (default: 5)
    ///
    /// This is also the upper bound of the render context pool, each running
    /// capture owning exactly one context.
    pub concurrency: usize,

    /// Contexts kept warm in the pool (default: 1)
    pub min_contexts: usize,

    /// Timeout applied to navigation, readiness waits and capture calls (default: 20 seconds)
    pub screenshot_timeout: Duration,

    /// How long a request may wait for admission (default: 60 seconds)
    pub queue_timeout: Duration,

    /// How long an admitted request may wait for a context (default: 20 seconds)
    pub acquire_timeout: Duration,

    /// Deadline for cleaning a context before it is destroyed instead (default: 2 seconds)
    pub cleanup_timeout: Duration,

    /// Grace period after network idle for late rendering work (default: 1 second)
    pub safety_delay: Duration,

    /// Upper bound for requested width and height (default: 3000)
    pub max_dimension: u32,

    /// Viewport used when a screenshot request doesn't specify one
    pub default_viewport: Viewport,

    /// Maximum number of frames in an animated capture (default: 1800, 2 minutes at 15fps)
    pub max_animation_frames: usize,

    /// Frame rate of animated captures (default: 15)
    pub animation_frame_rate: u16,

    /// Locale applied when the request has none (default: fr-FR)
    pub default_lang: String,

    /// Timezone applied when the request has none (default: Europe/Paris)
    pub default_timezone: String,

    /// Shared secret letting unauthenticated callers through (`key` query parameter)
    pub capture_secret: Option<String>,

    /// Request header carrying the caller identity set by an authenticating proxy
    ///
    /// When unset, no caller is ever identified and the capture endpoints are open.
    pub identity_header: Option<String>,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string (default: Chrome default)
    pub user_agent: Option<String>,

    /// `gifsicle` binary used to shrink animated captures; GIFs are returned raw without it
    pub gifsicle_path: Option<String>,

    /// Interval between background health checks (default: 15 seconds)
    pub health_check_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5607,
            public_url: "http://localhost:5607".to_string(),
            only_same_host: false,
            cookie_hosts: Vec::new(),
            concurrency: 5,
            min_contexts: 1,
            screenshot_timeout: Duration::from_secs(20),
            queue_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(20),
            cleanup_timeout: Duration::from_secs(2),
            safety_delay: Duration::from_secs(1),
            max_dimension: 3000,
            default_viewport: Viewport::default(),
            max_animation_frames: 1800,
            animation_frame_rate: 15,
            default_lang: "fr-FR".to_string(),
            default_timezone: "Europe/Paris".to_string(),
            capture_secret: None,
            identity_header: None,
            chrome_path: None,
            user_agent: None,
            gifsicle_path: None,
            health_check_interval: Duration::from_secs(15),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.concurrency == 0 {
            return Err(CaptureError::Configuration(
                "concurrency must be greater than 0".to_string(),
            ));
        }
        if self.min_contexts > self.concurrency {
            return Err(CaptureError::Configuration(format!(
                "min_contexts ({}) cannot exceed concurrency ({})",
                self.min_contexts, self.concurrency
            )));
        }
        if self.screenshot_timeout.is_zero() {
            return Err(CaptureError::Configuration(
                "screenshot timeout must be greater than 0".to_string(),
            ));
        }
        if self.max_dimension == 0 {
            return Err(CaptureError::Configuration(
                "max dimension must be greater than 0".to_string(),
            ));
        }
        if self.default_viewport.width > self.max_dimension
            || self.default_viewport.height > self.max_dimension
        {
            return Err(CaptureError::Configuration(
                "default viewport exceeds max dimension".to_string(),
            ));
        }
        if self.animation_frame_rate == 0 {
            return Err(CaptureError::Configuration(
                "animation frame rate must be greater than 0".to_string(),
            ));
        }
        if Url::parse(&self.public_url).is_err() {
            return Err(CaptureError::Configuration(format!(
                "public url {} is not a valid url",
                self.public_url
            )));
        }
        Ok(())
    }

    /// Host (with port) the service is published on.
    pub fn public_host(&self) -> Option<String> {
        extract_host(&self.public_url)
    }
}

/// Browser viewport configuration for screenshots
///
/// # Examples
///
/// ```rust
/// use capture_service::Viewport;
///
/// let wide = Viewport {
///     width: 1600,
///     ..Default::default()
/// };
/// assert_eq!(wide.height, 450);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 800)
    pub width: u32,

    /// Viewport height in pixels (default: 450)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 800,
            height: 450,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// Still image encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

/// What a capture produces
#[derive(Debug, Clone, PartialEq)]
pub enum OutputKind {
    /// A single screenshot of the viewport
    Image(ImageFormat),
    /// A printed document
    Pdf(PrintOptions),
    /// A GIF built frame by frame through `window.animateCaptureFrame()`
    Animation,
}

impl OutputKind {
    pub fn mime(&self) -> &'static str {
        match self {
            OutputKind::Image(ImageFormat::Png) => "image/png",
            OutputKind::Image(ImageFormat::Jpeg) => "image/jpeg",
            OutputKind::Pdf(_) => "application/pdf",
            OutputKind::Animation => "image/gif",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutputKind::Image(ImageFormat::Png) => "png",
            OutputKind::Image(ImageFormat::Jpeg) => "jpg",
            OutputKind::Pdf(_) => "pdf",
            OutputKind::Animation => "gif",
        }
    }

    /// Resolve the screenshot kind from the `type` parameter, falling back
    /// to the extension of the requested filename.
    pub fn screenshot(
        type_param: Option<&str>,
        filename: Option<&str>,
    ) -> Result<Self, CaptureError> {
        if let Some(kind) = type_param.filter(|t| !t.is_empty()) {
            return match kind.to_ascii_lowercase().as_str() {
                "png" => Ok(OutputKind::Image(ImageFormat::Png)),
                "jpg" | "jpeg" => Ok(OutputKind::Image(ImageFormat::Jpeg)),
                "gif" => Ok(OutputKind::Animation),
                other => Err(CaptureError::validation(format!(
                    "type must be one of png, jpg, gif (got {other})"
                ))),
            };
        }

        let extension = filename
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        Ok(match extension.as_deref() {
            Some("gif") => OutputKind::Animation,
            Some("jpg") | Some("jpeg") => OutputKind::Image(ImageFormat::Jpeg),
            _ => OutputKind::Image(ImageFormat::Png),
        })
    }
}

/// Bucket used by the admission queue to share capacity between requesters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FairnessKey(String);

impl FairnessKey {
    pub const DEFAULT: &'static str = "default";

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Explicit override first, then the requester identity, then the shared bucket.
    pub fn resolve(explicit: Option<&str>, identity: Option<&str>) -> Self {
        explicit
            .filter(|k| !k.is_empty())
            .or(identity.filter(|k| !k.is_empty()))
            .map(Self::new)
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FairnessKey {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl std::fmt::Display for FairnessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single capture to perform
///
/// Built from caller input and immutable afterwards. [`CaptureRequest::validate`]
/// runs before any engine resource is acquired.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub id: String,
    pub target: Url,
    pub output: OutputKind,
    pub lang: Option<String>,
    pub timezone: Option<String>,
    pub viewport: Option<Viewport>,
    pub cookies: Vec<Cookie>,
    pub timeout: Option<Duration>,
    pub fairness_key: FairnessKey,
}

impl CaptureRequest {
    pub fn new(target: &str, output: OutputKind) -> Result<Self, CaptureError> {
        let target = validate_url(target)?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            output,
            lang: None,
            timezone: None,
            viewport: None,
            cookies: Vec::new(),
            timeout: None,
            fairness_key: FairnessKey::default(),
        })
    }

    pub fn validate(&self, config: &Config) -> Result<(), CaptureError> {
        if let Some(viewport) = &self.viewport {
            if viewport.width == 0 || viewport.height == 0 {
                return Err(CaptureError::validation("width and height must be positive"));
            }
            if viewport.width > config.max_dimension {
                return Err(CaptureError::validation("width too large"));
            }
            if viewport.height > config.max_dimension {
                return Err(CaptureError::validation("height too large"));
            }
        }
        if matches!(self.timeout, Some(t) if t.is_zero()) {
            return Err(CaptureError::validation("timeout must be positive"));
        }
        if let OutputKind::Pdf(options) = &self.output {
            options.validate()?;
        }
        Ok(())
    }

    /// Timeout for this request's navigation and capture stages.
    pub fn effective_timeout(&self, config: &Config) -> Duration {
        self.timeout.unwrap_or(config.screenshot_timeout)
    }

    pub fn effective_lang<'a>(&'a self, config: &'a Config) -> &'a str {
        self.lang.as_deref().filter(|l| !l.is_empty()).unwrap_or(&config.default_lang)
    }

    pub fn effective_timezone<'a>(&'a self, config: &'a Config) -> &'a str {
        self.timezone
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&config.default_timezone)
    }
}

/// Bytes produced by a capture together with their MIME classification
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub request_id: String,
    pub target: String,
    pub data: Vec<u8>,
    pub mime: &'static str,
    pub captured_at: chrono::DateTime<chrono::Utc>,
    pub duration: Duration,
    pub readiness: crate::ReadinessOutcome,
}
