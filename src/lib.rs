//! # Capture Service
//!
//! Renders web pages into PNG/JPEG screenshots, PDFs and animated GIFs on
//! behalf of many concurrent callers, sharing one headless Chromium process.
//!
//! Every capture runs in its own incognito browsing context, so callers never
//! see each other's cookies, viewport or locale. A fair admission queue bounds
//! how many captures run at once, and a supervisor relaunches the browser in
//! place when it dies.
//!
//! ## Features
//!
//! - **Context Pool**: isolated browser contexts reused across captures, cleaned or destroyed after each one
//! - **Fair Admission**: per-requester FIFO buckets, served in random order when capacity frees up
//! - **Page Readiness**: network idle, an in-page `window.triggerCapture()` call, or a timeout
//! - **Engine Supervision**: automatic browser relaunch after an unexpected disconnect
//! - **Print Options**: paper format, margins in CSS units, landscape, page ranges, footer
//! - **Animations**: frame-by-frame GIF capture driven by `window.animateCaptureFrame()`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_service::{CaptureRequest, CaptureService, Config, ImageFormat, Metrics, OutputKind};
//! use capture_service::engine::chromium::ChromiumLauncher;
//! use capture_service::postprocess::Passthrough;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let launcher = Arc::new(ChromiumLauncher::new(&config));
//!     let service = CaptureService::start(config, launcher, Arc::new(Passthrough), Arc::new(Metrics::new())).await?;
//!
//!     let request = CaptureRequest::new("https://example.com", OutputKind::Image(ImageFormat::Png))?;
//!     let capture = service.capture(request).await?;
//!     println!("Captured {} bytes", capture.data.len());
//!
//!     service.shutdown(std::time::Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### HTTP Server
//! ```bash
//! capture-service --concurrency 8 serve
//! curl "http://localhost:5607/api/v1/screenshot?target=https://example.com&filename=shot.png"
//! ```
//!
//! ### Single Capture
//! ```bash
//! capture-service single --url https://example.com --output report.pdf --landscape
//! ```

/// Fair admission of captures into the limited running slots
pub mod admission;

/// Frame-by-frame GIF capture
pub mod animation;

/// The capture orchestrator
pub mod capture;

/// Command-line interface implementation
pub mod cli;

/// Configuration, request and result types
pub mod config;

/// Rendering engine capability and its Chromium implementation
pub mod engine;

/// Error types and error handling utilities
pub mod error;

/// Health checking of the engine, pool and queue
pub mod health;

/// HTTP API
pub mod http;

/// Prometheus metrics
pub mod metrics;

/// Render context pool
pub mod pool;

/// JPEG re-encoding and GIF assembly
pub mod postprocess;

/// PDF print layout
pub mod print;

/// Deciding when a navigated page is ready to capture
pub mod readiness;

/// Rendering engine supervision and restart
pub mod supervisor;

/// Utility functions and helpers
pub mod utils;


pub use capture::{CaptureService, ServiceStats};
pub use cli::{load_config, setup_logging, Cli, CliRunner, Commands};
pub use config::*;
pub use error::*;
pub use health::{HealthChecker, HealthLevel, HealthStatus};
pub use metrics::Metrics;
pub use readiness::ReadinessOutcome;
