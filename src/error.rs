use std::time::Duration;
use thiserror::Error;

/// Failures reported by the rendering engine collaborator.
///
/// These never reach a caller directly; the orchestrator folds them into a
/// [`CaptureError`] once it knows which stage they came from.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Engine launch failed: {0}")]
    Launch(String),

    #[error("Engine disconnected")]
    Disconnected,

    #[error("Engine operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl EngineError {
    pub fn protocol(err: impl std::fmt::Display) -> Self {
        EngineError::Protocol(err.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("{0}")]
    Validation(String),

    #[error("Authentication required")]
    Auth,

    #[error("No render context available after {0:?}")]
    AcquireTimeout(Duration),

    #[error("Capture was not admitted after {0:?}")]
    QueueTimeout(Duration),

    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Capture timed out after {0:?}")]
    CaptureTimeout(Duration),

    #[error("Animation frame {frame} was not captured after {timeout:?}")]
    FrameCaptureTimeout { frame: usize, timeout: Duration },

    #[error("Rendering engine disconnected")]
    EngineDisconnect,

    #[error("Rendering engine failed to start: {0}")]
    EngineStart(String),

    #[error("Rendering engine unavailable")]
    EngineUnavailable,

    #[error("Rendering engine error: {0}")]
    Engine(String),

    #[error("Context cleanup failed: {0}")]
    CleanupFailure(String),

    #[error("Output encoding failed: {0}")]
    Encoding(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl CaptureError {
    pub fn validation(message: impl Into<String>) -> Self {
        CaptureError::Validation(message.into())
    }

    /// The service is saturated; the caller may try again later.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            CaptureError::AcquireTimeout(_)
                | CaptureError::QueueTimeout(_)
                | CaptureError::EngineUnavailable
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CaptureError::AcquireTimeout(_)
                | CaptureError::QueueTimeout(_)
                | CaptureError::NavigationTimeout(_)
                | CaptureError::CaptureTimeout(_)
                | CaptureError::FrameCaptureTimeout { .. }
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            CaptureError::Validation(_) => 400,
            CaptureError::Auth => 401,
            CaptureError::AcquireTimeout(_)
            | CaptureError::QueueTimeout(_)
            | CaptureError::EngineUnavailable => 503,
            CaptureError::CaptureTimeout(_) | CaptureError::FrameCaptureTimeout { .. } => 504,
            _ => 500,
        }
    }

    /// Message safe to hand back to an HTTP caller.
    pub fn public_message(&self) -> String {
        match self.status_code() {
            500 => "Internal capture error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Validation(_) => "validation",
            CaptureError::Auth => "auth",
            CaptureError::AcquireTimeout(_) => "acquire_timeout",
            CaptureError::QueueTimeout(_) => "queue_timeout",
            CaptureError::NavigationTimeout(_) => "navigation_timeout",
            CaptureError::CaptureTimeout(_) => "capture_timeout",
            CaptureError::FrameCaptureTimeout { .. } => "frame_capture_timeout",
            CaptureError::EngineDisconnect => "engine_disconnect",
            CaptureError::EngineStart(_) => "engine_start",
            CaptureError::EngineUnavailable => "engine_unavailable",
            CaptureError::Engine(_) => "engine",
            CaptureError::CleanupFailure(_) => "cleanup",
            CaptureError::Encoding(_) => "encoding",
            CaptureError::Configuration(_) => "configuration",
            CaptureError::Io(_) => "io",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CaptureError::Validation(_) | CaptureError::Auth => ErrorSeverity::Low,
            CaptureError::NavigationTimeout(_) => ErrorSeverity::Low,
            CaptureError::Configuration(_) => ErrorSeverity::High,
            CaptureError::EngineStart(_) => ErrorSeverity::Critical,
            CaptureError::EngineDisconnect => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<EngineError> for CaptureError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Launch(message) => CaptureError::EngineStart(message),
            EngineError::Disconnected => CaptureError::EngineDisconnect,
            EngineError::Timeout(after) => CaptureError::CaptureTimeout(after),
            EngineError::Navigation(message) => CaptureError::Engine(message),
            EngineError::Protocol(message) => CaptureError::Engine(message),
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Configuration(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::Encoding(err.to_string())
    }
}
