//! Synthetic source (`stub://`) for demos and tests.
//!
//! Produces a static gradient that shifts every `SCENE_PERIOD` frames, so a
//! change-detecting backend sees an occasional "object entry" rather than
//! motion on every frame. Reads are paced to the configured frame rate.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use super::{CaptureConfig, CaptureSource};
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const SCENE_PERIOD: u64 = 50;

pub struct SyntheticSource {
    config: CaptureConfig,
    open: bool,
    frame_count: u64,
    scene_state: u8,
    next_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            open: false,
            frame_count: 0,
            scene_state: 0,
            next_frame_at: None,
        }
    }

    fn frame_interval(&self) -> Duration {
        if self.config.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1000 / self.config.target_fps as u64)
        }
    }

    fn pace(&mut self) {
        let interval = self.frame_interval();
        if let Some(at) = self.next_frame_at {
            let now = Instant::now();
            if at > now {
                std::thread::sleep(at - now);
            }
        }
        self.next_frame_at = Some(Instant::now() + interval);
    }

    fn generate_pixels(&mut self, width: u32, height: u32) -> Vec<u8> {
        if self.frame_count % SCENE_PERIOD == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let shift = self.scene_state as usize * 37;
        let mut pixels = vec![0u8; width as usize * height as usize * 3];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let x = i % width as usize;
            let y = i / width as usize;
            px[0] = ((x + shift) % 256) as u8;
            px[1] = ((y + shift / 2) % 256) as u8;
            px[2] = self.scene_state.wrapping_mul(29);
        }
        pixels
    }
}

impl CaptureSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.config.source)
    }

    fn open(&mut self) -> Result<()> {
        if !self.open {
            log::info!("capture: opened {}", self.describe());
        }
        self.open = true;
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            return Err(anyhow!("synthetic source {} is not open", self.config.source));
        }
        self.pace();
        self.frame_count += 1;
        let (width, height) = match self.config.resize.filter(|s| !s.is_unset()) {
            Some(size) => (size.width, size.height),
            None => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
        };
        let pixels = self.generate_pixels(width, height);
        Frame::from_rgb(width, height, pixels, self.frame_count).map(Some)
    }

    fn release(&mut self) {
        if self.open {
            log::info!("capture: released {}", self.describe());
        }
        self.open = false;
        self.next_frame_at = None;
    }
}
