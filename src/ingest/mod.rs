//! Frame ingestion sources.
//!
//! A `FrameSource` stands in for the live video element: the pipeline's
//! capture loop pulls frames from it and publishes the latest one.
//! - `stub://name` yields synthetic frames (tests, demos)
//! - `http(s)://...` reads an MJPEG stream or polls a JPEG snapshot URL
//!
//! Sources own their camera connection for the lifetime of the pipeline;
//! `release()` must be called on shutdown so the device is not held open.

pub mod mjpeg;
pub mod synthetic;

pub use mjpeg::{MjpegConfig, MjpegSource};
pub use synthetic::{SyntheticConfig, SyntheticSource};

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use crate::config::CameraSettings;
use crate::frame::Frame;

pub trait FrameSource: Send {
    /// Open the underlying stream.
    fn connect(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame>;

    fn is_healthy(&self) -> bool;

    /// Human-readable source identifier for logs.
    fn describe(&self) -> String;

    fn frames_captured(&self) -> u64;

    /// Drop the stream and any device handle.
    fn release(&mut self) {}
}

/// Open the configured camera, choosing the source by URL scheme.
pub fn open_source(camera: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    let url = camera.url.as_str();
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig {
            url: url.to_string(),
            target_fps: camera.target_fps,
            width: camera.width,
            height: camera.height,
        })));
    }
    let parsed = url::Url::parse(url).context("parse camera url")?;
    match parsed.scheme() {
        "http" | "https" => Ok(Box::new(MjpegSource::new(MjpegConfig {
            url: url.to_string(),
            target_fps: camera.target_fps,
            max_frame_bytes: camera.max_frame_bytes,
        }))),
        other => Err(anyhow!(
            "unsupported camera scheme '{}'; expected stub:// or http(s)://",
            other
        )),
    }
}

/// Minimum spacing between delivered frames, or `None` when pacing is off.
pub(crate) fn pace(target_fps: u32) -> Option<Duration> {
    (target_fps > 0).then(|| Duration::from_secs(1) / target_fps)
}
