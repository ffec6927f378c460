//! Captured frames.
//!
//! - `Frame`: one decoded RGB image plus its monotonic capture instant.
//! - `FrameSize`: optional resize target applied at capture time.
//! - `encode_jpeg`: the single JPEG encode path used for viewer and alert payloads.
//!
//! A frame is owned by the acquisition loop until it is handed to the detector
//! and is dropped at the end of the iteration that produced it.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// JPEG quality used for every encoded payload.
pub const JPEG_QUALITY: u8 = 85;

/// One decoded frame.
pub struct Frame {
    image: RgbImage,
    captured_at: Instant,
    sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            captured_at: Instant::now(),
            sequence,
        }
    }

    /// Build a frame from tightly packed RGB8 pixels.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>, sequence: u64) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer is {} bytes, expected {} for {}x{} RGB",
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", width, height))?;
        Ok(Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Raw RGB8 pixel bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Source-local frame counter.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Resize to `size` when one is set. The capture instant is preserved.
    pub fn resized(self, size: Option<FrameSize>) -> Self {
        let Some(size) = size.filter(|s| !s.is_unset()) else {
            return self;
        };
        if self.image.width() == size.width && self.image.height() == size.height {
            return self;
        }
        let image = imageops::resize(&self.image, size.width, size.height, FilterType::Triangle);
        Self { image, ..self }
    }
}

/// Resize target, written `WIDTHxHEIGHT`. `0x0` means "keep the source size".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_unset(&self) -> bool {
        self.width == 0 && self.height == 0
    }
}

impl FromStr for FrameSize {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (w, h) = value
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| anyhow!("frame size '{}' must look like 640x480", value))?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| anyhow!("frame width '{}' is not an integer", w))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| anyhow!("frame height '{}' is not an integer", h))?;
        if (width == 0) != (height == 0) {
            return Err(anyhow!(
                "frame size '{}' must set both dimensions or neither",
                value
            ));
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Encode an RGB image as JPEG.
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(image)
        .context("encode frame as jpeg")?;
    Ok(buf)
}
