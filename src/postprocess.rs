//! Output post-processing: JPEG re-encoding, GIF assembly and compression

use crate::CaptureError;
use async_trait::async_trait;
use image::codecs::gif::{GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::{Delay, Frame};
use std::io::Write;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub const JPEG_QUALITY: u8 = 90;

/// Re-encode a PNG screenshot as JPEG.
pub fn png_to_jpeg(png: &[u8], quality: u8) -> Result<Vec<u8>, CaptureError> {
    let decoded = image::load_from_memory_with_format(png, image::ImageFormat::Png)?;
    let rgb = decoded.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality).encode_image(&rgb)?;
    Ok(jpeg)
}

/// Animated GIF written frame by frame into `W`
pub struct GifStream<W: Write> {
    encoder: GifEncoder<W>,
    delay: Delay,
    frames: usize,
}

impl<W: Write> GifStream<W> {
    pub fn new(writer: W, frame_rate: u16) -> Result<Self, CaptureError> {
        let mut encoder = GifEncoder::new(writer);
        encoder.set_repeat(Repeat::Infinite)?;
        Ok(Self {
            encoder,
            delay: Delay::from_numer_denom_ms(1000, u32::from(frame_rate.max(1))),
            frames: 0,
        })
    }

    /// Decode a PNG screenshot and append it as the next frame.
    pub fn push_png(&mut self, png: &[u8]) -> Result<(), CaptureError> {
        let decoded = image::load_from_memory_with_format(png, image::ImageFormat::Png)?;
        let frame = Frame::from_parts(decoded.to_rgba8(), 0, 0, self.delay);
        self.encoder.encode_frame(frame)?;
        self.frames += 1;
        Ok(())
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

/// A [`GifStream`] running on a blocking thread, fed PNG frames over a channel
pub struct BackgroundGif {
    frames: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<Result<Vec<u8>, CaptureError>>,
}

impl BackgroundGif {
    /// `buffer` frames may be queued before [`push_png`](Self::push_png) waits.
    pub fn spawn(frame_rate: u16, buffer: usize) -> Self {
        let (frames, mut rx) = mpsc::channel::<Vec<u8>>(buffer.max(1));
        let task = tokio::task::spawn_blocking(move || {
            let mut raw = Vec::new();
            let count = {
                let mut gif = GifStream::new(&mut raw, frame_rate)?;
                while let Some(png) = rx.blocking_recv() {
                    gif.push_png(&png)?;
                }
                gif.frames()
            };
            debug!("encoded {} GIF frames ({} bytes raw)", count, raw.len());
            Ok(raw)
        });
        Self { frames, task }
    }

    /// Queue the next frame. `false` once the encoder has stopped; its error
    /// comes out of [`finish`](Self::finish).
    pub async fn push_png(&self, png: Vec<u8>) -> bool {
        self.frames.send(png).await.is_ok()
    }

    /// Close the stream and wait for the encoded GIF.
    pub async fn finish(self) -> Result<Vec<u8>, CaptureError> {
        drop(self.frames);
        self.task
            .await
            .map_err(|e| CaptureError::Encoding(e.to_string()))?
    }
}

/// Shrinks an assembled GIF before it is returned
#[async_trait]
pub trait FrameCompressor: Send + Sync {
    async fn compress(&self, gif: Vec<u8>) -> Result<Vec<u8>, CaptureError>;
}

/// Returns the GIF untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

#[async_trait]
impl FrameCompressor for Passthrough {
    async fn compress(&self, gif: Vec<u8>) -> Result<Vec<u8>, CaptureError> {
        Ok(gif)
    }
}

/// Pipes the GIF through an external `gifsicle`
#[derive(Debug, Clone)]
pub struct Gifsicle {
    program: String,
    optimization_level: u8,
}

impl Gifsicle {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            optimization_level: 2,
        }
    }
}

#[async_trait]
impl FrameCompressor for Gifsicle {
    async fn compress(&self, gif: Vec<u8>) -> Result<Vec<u8>, CaptureError> {
        let raw_size = gif.len();
        let mut child = Command::new(&self.program)
            .arg(format!("-O{}", self.optimization_level))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::Encoding("gifsicle stdin unavailable".to_string()))?;
        let writer = tokio::spawn(async move {
            stdin.write_all(&gif).await?;
            stdin.shutdown().await
        });

        let output = child.wait_with_output().await?;
        writer
            .await
            .map_err(|e| CaptureError::Encoding(e.to_string()))??;

        if !output.status.success() {
            return Err(CaptureError::Encoding(format!(
                "gifsicle exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("gifsicle compressed {} bytes to {}", raw_size, output.stdout.len());
        Ok(output.stdout)
    }
}
