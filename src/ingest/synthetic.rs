//! Synthetic frame source for `stub://` URLs.

use anyhow::{anyhow, Result};
use std::time::Instant;

use super::{pace, FrameSource};
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub url: String,
    /// 0 disables pacing.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    scene_state: u8,
    connected: bool,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
            connected: false,
            last_frame_at: None,
        }
    }

    /// A moving diagonal gradient; the scene shifts every 50 frames.
    fn generate_pixels(&mut self) -> Vec<u8> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let shift = self.frame_count as usize + self.scene_state as usize * 17;
        let mut pixels = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) * 3;
                pixels[i] = ((x + shift) % 256) as u8;
                pixels[i + 1] = ((y + shift / 2) % 256) as u8;
                pixels[i + 2] = ((x + y) % 256) as u8;
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {}", self.config.url);
        self.connected = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected; call connect() first"));
        }
        if let (Some(spacing), Some(last)) = (pace(self.config.target_fps), self.last_frame_at) {
            if let Some(wait) = spacing.checked_sub(last.elapsed()) {
                std::thread::sleep(wait);
            }
        }
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        let pixels = self.generate_pixels();
        Frame::new(pixels, self.config.width, self.config.height)
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn release(&mut self) {
        if self.connected {
            log::info!("SyntheticSource: released {}", self.config.url);
        }
        self.connected = false;
    }
}
