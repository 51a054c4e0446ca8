use crate::engine::chromium::ChromiumLauncher;
use crate::health::HealthChecker;
use crate::http::{self, AppState, TrustedHeader};
use crate::metrics::install_prometheus;
use crate::postprocess::{FrameCompressor, Gifsicle, Passthrough};
use crate::print::PrintOptions;
use crate::utils::{format_bytes, format_duration};
use crate::{CaptureRequest, CaptureService, Config, Metrics, OutputKind, Viewport};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "capture-service")]
#[command(about = "Render web pages to images, PDFs and animated GIFs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "PORT", help = "HTTP listen port")]
    pub port: Option<u16>,

    #[arg(long, env = "PUBLIC_URL", help = "URL the service is published at")]
    pub public_url: Option<String>,

    #[arg(long, env = "ONLY_SAME_HOST", help = "Reject targets outside the public host")]
    pub only_same_host: Option<bool>,

    #[arg(long, env = "SCREENSHOT_TIMEOUT", help = "Capture timeout in milliseconds")]
    pub screenshot_timeout: Option<u64>,

    #[arg(long, env = "CONCURRENCY", help = "Maximum concurrent captures")]
    pub concurrency: Option<usize>,

    #[arg(long, env = "DEFAULT_LANG", help = "Locale used when a request has none")]
    pub default_lang: Option<String>,

    #[arg(long, env = "DEFAULT_TIMEZONE", help = "Timezone used when a request has none")]
    pub default_timezone: Option<String>,

    #[arg(
        long,
        env = "SECRET_CAPTURE",
        hide_env_values = true,
        help = "Shared secret accepted as the key parameter"
    )]
    pub capture_secret: Option<String>,

    #[arg(long, env = "IDENTITY_HEADER", help = "Header carrying the authenticated caller")]
    pub identity_header: Option<String>,

    #[arg(long, env = "CHROME_PATH", help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, env = "GIFSICLE_PATH", help = "gifsicle executable used to compress GIFs")]
    pub gifsicle_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the capture HTTP API
    Serve,

    /// Capture a single URL to a file
    Single {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,

        #[arg(long, help = "Output type (png, jpg, gif, pdf); defaults to the output extension")]
        format: Option<String>,

        #[arg(long, help = "Viewport width")]
        width: Option<u32>,

        #[arg(long, help = "Viewport height")]
        height: Option<u32>,

        #[arg(long, help = "Locale, e.g. fr-FR")]
        lang: Option<String>,

        #[arg(long, help = "Timezone, e.g. Europe/Paris")]
        timezone: Option<String>,

        #[arg(long, help = "Print in landscape orientation")]
        landscape: bool,

        #[arg(long, help = "Footer label printed on every page")]
        footer: Option<String>,
    },

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Apply flag and environment overrides on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(public_url) = &self.public_url {
            config.public_url = public_url.clone();
        }
        if let Some(only_same_host) = self.only_same_host {
            config.only_same_host = only_same_host;
        }
        if let Some(timeout) = self.screenshot_timeout {
            config.screenshot_timeout = Duration::from_millis(timeout);
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(lang) = &self.default_lang {
            config.default_lang = lang.clone();
        }
        if let Some(timezone) = &self.default_timezone {
            config.default_timezone = timezone.clone();
        }
        if let Some(secret) = &self.capture_secret {
            config.capture_secret = Some(secret.clone());
        }
        if let Some(header) = &self.identity_header {
            config.identity_header = Some(header.clone());
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
        if let Some(gifsicle_path) = &self.gifsicle_path {
            config.gifsicle_path = Some(gifsicle_path.clone());
        }
    }
}

pub async fn read_config_file(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Configuration file (or defaults), then flags and environment, then validation.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => read_config_file(path).await?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!("Concurrency: {}", config.concurrency);
    info!("Capture timeout: {:?}", config.screenshot_timeout);
    info!("Public URL: {}", config.public_url);
    Ok(config)
}

#[derive(Debug, Clone, Default)]
pub struct SingleOptions {
    pub url: String,
    pub output: PathBuf,
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub lang: Option<String>,
    pub timezone: Option<String>,
    pub landscape: bool,
    pub footer: Option<String>,
}

impl SingleOptions {
    pub fn output_kind(&self) -> anyhow::Result<OutputKind> {
        let filename = self.output.to_str();
        let is_pdf = match self.format.as_deref() {
            Some(format) => format.eq_ignore_ascii_case("pdf"),
            None => filename.map_or(false, |f| f.to_ascii_lowercase().ends_with(".pdf")),
        };
        if is_pdf {
            return Ok(OutputKind::Pdf(PrintOptions {
                landscape: self.landscape,
                footer: self.footer.clone(),
                ..Default::default()
            }));
        }
        Ok(OutputKind::screenshot(self.format.as_deref(), filename)?)
    }

    pub fn request(&self, config: &Config) -> anyhow::Result<CaptureRequest> {
        let output = self.output_kind()?;
        let mut request = CaptureRequest::new(&self.url, output)?;
        if self.width.is_some() || self.height.is_some() {
            request.viewport = Some(Viewport {
                width: self.width.unwrap_or(config.default_viewport.width),
                height: self.height.unwrap_or(config.default_viewport.height),
                ..config.default_viewport.clone()
            });
        }
        request.lang = self.lang.clone();
        request.timezone = self.timezone.clone();
        Ok(request)
    }
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        command: Commands,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        match command {
            Commands::Serve => self.run_serve(shutdown).await,
            Commands::Single {
                url,
                output,
                format,
                width,
                height,
                lang,
                timezone,
                landscape,
                footer,
            } => {
                self.run_single(SingleOptions {
                    url,
                    output,
                    format,
                    width,
                    height,
                    lang,
                    timezone,
                    landscape,
                    footer,
                })
                .await
            }
            Commands::Validate { config } => validate_config(&config).await,
        }
    }

    async fn start_service(&self, metrics: Arc<Metrics>) -> anyhow::Result<Arc<CaptureService>> {
        let launcher = Arc::new(ChromiumLauncher::new(&self.config));
        let compressor: Arc<dyn FrameCompressor> = match &self.config.gifsicle_path {
            Some(program) => Arc::new(Gifsicle::new(program.as_str())),
            None => Arc::new(Passthrough),
        };
        let service =
            CaptureService::start(self.config.clone(), launcher, compressor, metrics).await?;
        Ok(service)
    }

    pub async fn run_serve(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        // the recorder must exist before metric handles are registered
        let prometheus = install_prometheus()?;
        let metrics = Arc::new(Metrics::new());
        let service = self.start_service(metrics).await?;

        let health = Arc::new(HealthChecker::new(service.clone()));
        let health_task = health.clone().spawn(self.config.health_check_interval);

        let mut state = AppState::new(service.clone(), health).with_prometheus(prometheus);
        if let Some(header) = &self.config.identity_header {
            state = state.with_authenticator(Arc::new(TrustedHeader::new(header.as_str())));
        }

        let listener = TcpListener::bind(("0.0.0.0", self.config.port))
            .await
            .with_context(|| format!("binding port {}", self.config.port))?;
        let served = http::serve(listener, state, shutdown).await;

        health_task.abort();
        service.shutdown(self.config.screenshot_timeout).await;
        served.context("HTTP server failed")
    }

    pub async fn run_single(&self, options: SingleOptions) -> anyhow::Result<()> {
        info!("Capturing: {}", options.url);
        let request = options.request(&self.config)?;

        let service = self.start_service(Arc::new(Metrics::new())).await?;
        let outcome = service.capture(request).await;
        service.shutdown(Duration::from_secs(2)).await;
        let result = outcome?;

        if let Some(parent) = options.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&options.output, &result.data).await?;
        info!("Capture saved to: {}", options.output.display());

        println!("Capture completed successfully:");
        println!("  URL: {}", result.target);
        println!("  Output: {}", options.output.display());
        println!("  Type: {}", result.mime);
        println!("  Size: {}", format_bytes(result.data.len()));
        println!("  Duration: {}", format_duration(result.duration));
        println!("  Readiness: {:?}", result.readiness);
        Ok(())
    }
}

pub async fn validate_config(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());

    let config = read_config_file(path).await?;
    config
        .validate()
        .map_err(|e| anyhow!("{} is invalid: {}", path.display(), e))?;

    println!("Configuration is valid:");
    println!("  Port: {}", config.port);
    println!("  Public URL: {}", config.public_url);
    println!("  Concurrency: {}", config.concurrency);
    println!("  Timeout: {:?}", config.screenshot_timeout);
    println!(
        "  Default viewport: {}x{}",
        config.default_viewport.width, config.default_viewport.height
    );
    println!("  Locale: {} ({})", config.default_lang, config.default_timezone);
    Ok(())
}

/// Install the fmt subscriber. `RUST_LOG` takes precedence over `verbose`.
pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImageFormat;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_flags_override_config() {
        let cli = parse(&[
            "capture-service",
            "--concurrency",
            "3",
            "--screenshot-timeout",
            "1500",
            "--only-same-host",
            "true",
            "--default-lang",
            "es",
            "serve",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.concurrency, 3);
        assert_eq!(config.screenshot_timeout, Duration::from_millis(1500));
        assert!(config.only_same_host);
        assert_eq!(config.default_lang, "es");
        assert_eq!(config.default_timezone, "Europe/Paris");
        assert!(matches!(cli.command, Commands::Serve));
    }

    #[test]
    fn test_single_output_kind() {
        let options = SingleOptions {
            url: "https://example.com".to_string(),
            output: PathBuf::from("out/report.pdf"),
            landscape: true,
            ..Default::default()
        };
        assert!(matches!(options.output_kind().unwrap(), OutputKind::Pdf(p) if p.landscape));

        let options = SingleOptions {
            output: PathBuf::from("shot.jpg"),
            ..options
        };
        assert_eq!(options.output_kind().unwrap(), OutputKind::Image(ImageFormat::Jpeg));

        let options = SingleOptions {
            format: Some("gif".to_string()),
            ..options
        };
        assert_eq!(options.output_kind().unwrap(), OutputKind::Animation);
    }

    #[test]
    fn test_single_request_viewport() {
        let config = Config::default();
        let options = SingleOptions {
            url: "https://example.com".to_string(),
            output: PathBuf::from("shot.png"),
            width: Some(1280),
            ..Default::default()
        };
        let request = options.request(&config).unwrap();
        let viewport = request.viewport.unwrap();
        assert_eq!((viewport.width, viewport.height), (1280, 450));

        let options = SingleOptions {
            width: None,
            ..options
        };
        assert!(options.request(&config).unwrap().viewport.is_none());
    }

    #[tokio::test]
    async fn test_validate_config_file() {
        let dir = std::env::temp_dir();
        let valid = dir.join(format!("capture-config-{}.json", uuid::Uuid::new_v4()));
        fs::write(&valid, r#"{"concurrency": 4, "port": 8080}"#).await.unwrap();
        assert!(validate_config(&valid).await.is_ok());
        assert_eq!(read_config_file(&valid).await.unwrap().port, 8080);

        let invalid = dir.join(format!("capture-config-{}.json", uuid::Uuid::new_v4()));
        fs::write(&invalid, r#"{"concurrency": 0}"#).await.unwrap();
        assert!(validate_config(&invalid).await.is_err());

        let _ = fs::remove_file(&valid).await;
        let _ = fs::remove_file(&invalid).await;
    }
}
