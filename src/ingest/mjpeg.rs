//! HTTP camera source.
//!
//! A camera answering with `multipart/x-mixed-replace` is read part by part:
//! each part's headers are parsed and the body is taken by `Content-Length`
//! when the camera sends one, or up to the JPEG end marker when it does not.
//! Any other response type is treated as a snapshot endpoint and fetched again
//! for every frame. Every body is capped at `max_frame_bytes`.

use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader, Read};
use std::time::{Duration, Instant};

use super::{pace, FrameSource};
use crate::frame::Frame;

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
const MAX_HEADER_LINE: u64 = 1024;
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct MjpegConfig {
    pub url: String,
    /// 0 disables pacing.
    pub target_fps: u32,
    pub max_frame_bytes: usize,
}

pub struct MjpegSource {
    config: MjpegConfig,
    agent: ureq::Agent,
    stream: Option<CameraStream>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
    failed: bool,
}

enum CameraStream {
    Multipart(PartReader<Box<dyn Read + Send + Sync>>),
    Snapshot,
}

impl MjpegSource {
    pub fn new(config: MjpegConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(HTTP_TIMEOUT)
            .timeout_read(HTTP_TIMEOUT)
            .build();
        Self {
            config,
            agent,
            stream: None,
            last_frame_at: None,
            frame_count: 0,
            failed: false,
        }
    }

    fn read_jpeg(&mut self) -> Result<Vec<u8>> {
        match self.stream.as_mut() {
            Some(CameraStream::Multipart(parts)) => parts.next_jpeg(),
            Some(CameraStream::Snapshot) => {
                fetch_snapshot(&self.agent, &self.config.url, self.config.max_frame_bytes)
            }
            None => Err(anyhow!("camera {} is not connected", self.config.url)),
        }
    }
}

impl FrameSource for MjpegSource {
    fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .with_context(|| format!("connect to camera {}", self.config.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_string();
        let stream = if content_type.to_ascii_lowercase().starts_with("multipart/") {
            let boundary = multipart_boundary(&content_type);
            log::info!(
                "camera {}: multipart stream (boundary {})",
                self.config.url,
                boundary.as_deref().unwrap_or("unknown")
            );
            CameraStream::Multipart(PartReader::new(
                response.into_reader(),
                boundary,
                self.config.max_frame_bytes,
            ))
        } else {
            log::info!("camera {}: polling snapshots", self.config.url);
            CameraStream::Snapshot
        };
        self.stream = Some(stream);
        self.failed = false;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let spacing = pace(self.config.target_fps);
        loop {
            if matches!(self.stream, Some(CameraStream::Snapshot)) {
                if let (Some(spacing), Some(last)) = (spacing, self.last_frame_at) {
                    if let Some(wait) = spacing.checked_sub(last.elapsed()) {
                        std::thread::sleep(wait);
                    }
                }
            }

            let jpeg = match self.read_jpeg() {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            };

            // A live stream runs at the camera's rate; skip parts that come
            // in faster than the target.
            let now = Instant::now();
            let early = match (spacing, self.last_frame_at) {
                (Some(spacing), Some(last)) => now.duration_since(last) < spacing,
                _ => false,
            };
            if early {
                continue;
            }

            let image = image::load_from_memory(&jpeg).context("decode camera jpeg")?;
            self.frame_count += 1;
            self.last_frame_at = Some(now);
            self.failed = false;
            return Ok(Frame::from_image(image.into_rgb8()));
        }
    }

    /// Unhealthy once a read fails; the capture loop then reconnects.
    fn is_healthy(&self) -> bool {
        self.stream.is_some() && !self.failed
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            log::info!("camera {}: released", self.config.url);
        }
    }
}

/// `boundary` parameter of a multipart content type, without leading dashes.
fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"').trim_start_matches('-');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Splits a multipart body into JPEG parts.
struct PartReader<R> {
    reader: BufReader<R>,
    boundary: Option<String>,
    max_part_bytes: usize,
}

impl<R: Read> PartReader<R> {
    fn new(reader: R, boundary: Option<String>, max_part_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            boundary,
            max_part_bytes,
        }
    }

    /// Next part whose body is a JPEG. Parts of other types are skipped.
    fn next_jpeg(&mut self) -> Result<Vec<u8>> {
        loop {
            let content_length = self.read_part_headers()?;
            let body = match content_length {
                Some(len) if len > self.max_part_bytes => {
                    return Err(anyhow!(
                        "camera part of {} bytes exceeds the {} byte frame limit",
                        len,
                        self.max_part_bytes
                    ))
                }
                Some(len) => {
                    let mut body = vec![0; len];
                    self.reader.read_exact(&mut body).context("read camera part")?;
                    body
                }
                None => self.read_to_end_marker()?,
            };
            if body.starts_with(&JPEG_SOI) {
                return Ok(body);
            }
            log::debug!("skipping non-jpeg camera part ({} bytes)", body.len());
        }
    }

    /// Skip to the next boundary line, then consume the part headers.
    /// Returns the declared `Content-Length`, if any.
    fn read_part_headers(&mut self) -> Result<Option<usize>> {
        let mut skipped = 0usize;
        loop {
            let line = self.read_line()?;
            if self.is_boundary(&line) {
                break;
            }
            skipped += line.len();
            if skipped > self.max_part_bytes {
                return Err(anyhow!("no multipart boundary within {} bytes", self.max_part_bytes));
            }
        }

        let mut content_length = None;
        loop {
            let line = self.read_line()?;
            let line = line.trim();
            if line.is_empty() {
                return Ok(content_length);
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok();
                }
            }
        }
    }

    fn is_boundary(&self, line: &str) -> bool {
        let Some(marker) = line.trim_end().strip_prefix("--") else {
            return false;
        };
        let marker = marker.trim_start_matches('-');
        match &self.boundary {
            Some(boundary) => marker.starts_with(boundary.as_str()),
            None => !marker.is_empty(),
        }
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::new();
        let read = (&mut self.reader)
            .take(MAX_HEADER_LINE)
            .read_until(b'\n', &mut line)
            .context("read camera stream")?;
        if read == 0 {
            return Err(anyhow!("camera stream ended"));
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Body of a part without `Content-Length`: everything up to and
    /// including the JPEG end marker.
    fn read_to_end_marker(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let budget = (self.max_part_bytes + 1).saturating_sub(body.len()) as u64;
            let read = (&mut self.reader)
                .take(budget)
                .read_until(JPEG_EOI[1], &mut body)
                .context("read camera part")?;
            if body.ends_with(&JPEG_EOI) {
                return Ok(body);
            }
            if body.len() > self.max_part_bytes {
                return Err(anyhow!(
                    "camera part exceeds the {} byte frame limit",
                    self.max_part_bytes
                ));
            }
            if read == 0 {
                return Err(anyhow!("camera stream ended inside a part"));
            }
        }
    }
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str, max_bytes: usize) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(max_bytes as u64 + 1)
        .read_to_end(&mut bytes)
        .context("read snapshot")?;
    if bytes.len() > max_bytes {
        return Err(anyhow!("snapshot exceeds the {} byte frame limit", max_bytes));
    }
    if !bytes.starts_with(&JPEG_SOI) {
        return Err(anyhow!("snapshot from {} is not a jpeg", url));
    }
    Ok(bytes)
}
