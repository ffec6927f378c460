use anyhow::Result;
use image::{Rgb, RgbImage};
use sha2::{Digest, Sha256};
use std::time::Instant;

use crate::detect::backend::Detector;
use crate::detect::result::{Detection, DetectorOutput};
use crate::frame::Frame;

/// Class id reported for scene changes.
pub const MOTION_CLASS_ID: u32 = 0;
const MOTION_CONFIDENCE: f32 = 0.85;
const OUTLINE_PX: u32 = 4;
const OUTLINE: Rgb<u8> = Rgb([255, 0, 0]);

/// Change detector. Reports one untracked detection whenever the frame
/// content differs from the previous frame, and outlines such frames in red.
#[derive(Default)]
pub struct MotionDetector {
    last_hash: Option<[u8; 32]>,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Detector for MotionDetector {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Option<DetectorOutput>> {
        let started = Instant::now();
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();

        let motion = self.last_hash.is_some_and(|prev| prev != current_hash);
        self.last_hash = Some(current_hash);

        let mut annotated = frame.image().clone();
        let detections = if motion {
            outline(&mut annotated);
            vec![Detection::new(MOTION_CLASS_ID, MOTION_CONFIDENCE)]
        } else {
            Vec::new()
        };

        Ok(Some(DetectorOutput {
            detections,
            annotated,
            inference_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
        }))
    }
}

fn outline(image: &mut RgbImage) {
    let (width, height) = image.dimensions();
    for (x, y, px) in image.enumerate_pixels_mut() {
        if x < OUTLINE_PX
            || y < OUTLINE_PX
            || x + OUTLINE_PX >= width
            || y + OUTLINE_PX >= height
        {
            *px = OUTLINE;
        }
    }
}
