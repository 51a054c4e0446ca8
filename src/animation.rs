//! Frame-by-frame animated capture
//!
//! The page drives the animation itself: each call to
//! `window.animateCaptureFrame()` renders the next frame and reports whether
//! the animation is over.

use crate::engine::RenderSession;
use crate::postprocess::{BackgroundGif, FrameCompressor};
use crate::{CaptureError, EngineError};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Screenshots queued ahead of the encoder.
const ENCODE_BUFFER: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct AnimationSettings {
    pub max_frames: usize,
    pub frame_rate: u16,
    /// Deadline for each call into the page: advancing a frame and taking its screenshot.
    pub frame_timeout: Duration,
}

/// Capture frames until the page reports completion or the frame budget runs out.
///
/// A frame that misses its deadline fails the whole capture rather than
/// truncating the animation. Frames are encoded on a blocking thread.
pub async fn capture_animation(
    session: &dyn RenderSession,
    settings: AnimationSettings,
    compressor: &dyn FrameCompressor,
) -> Result<Vec<u8>, CaptureError> {
    let gif = BackgroundGif::spawn(settings.frame_rate, ENCODE_BUFFER);
    let mut frames = 0;
    let mut stopped = false;
    while !stopped && frames < settings.max_frames {
        let frame = frames + 1;
        stopped = frame_step(frame, settings.frame_timeout, session.advance_animation()).await?;
        let png = frame_step(frame, settings.frame_timeout, session.screenshot()).await?;
        frames = frame;
        if !gif.push_png(png).await {
            break;
        }
    }

    let raw = gif.finish().await?;
    debug!("animation captured in {} frames ({} bytes raw)", frames, raw.len());
    compressor.compress(raw).await
}

async fn frame_step<T>(
    frame: usize,
    limit: Duration,
    call: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, CaptureError> {
    match timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(CaptureError::FrameCaptureTimeout {
            frame,
            timeout: limit,
        }),
    }
}
