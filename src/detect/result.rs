use image::RgbImage;

/// One object reported by a detector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub class_id: u32,
    /// Persistent identity assigned by the detector's tracker, when tracking is on.
    pub track_id: Option<i64>,
    pub confidence: f32,
}

impl Detection {
    pub fn new(class_id: u32, confidence: f32) -> Self {
        Self {
            class_id,
            track_id: None,
            confidence,
        }
    }

    pub fn tracked(class_id: u32, track_id: i64, confidence: f32) -> Self {
        Self {
            class_id,
            track_id: Some(track_id),
            confidence,
        }
    }
}

/// Everything a detector returns for one frame.
#[derive(Clone, Debug)]
pub struct DetectorOutput {
    pub detections: Vec<Detection>,
    /// Frame with the detector's annotations drawn on it.
    pub annotated: RgbImage,
    /// Inference time in milliseconds, when the backend measures it.
    pub inference_ms: Option<f64>,
}
