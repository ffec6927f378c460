use crate::detect::result::Detection;

/// Default minimum confidence for a detection to count.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;

/// Drops detections the pipeline should not act on.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionFilter {
    /// Detections below this confidence are dropped.
    pub min_confidence: f32,
    /// Class allowlist; empty accepts every class.
    pub classes: Vec<u32>,
    /// When false, track ids are stripped so novelty falls back to presence.
    pub tracking: bool,
}

impl Default for DetectionFilter {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_CONFIDENCE_THRESHOLD,
            classes: Vec::new(),
            tracking: true,
        }
    }
}

impl DetectionFilter {
    pub fn accepts(&self, detection: &Detection) -> bool {
        detection.confidence >= self.min_confidence
            && (self.classes.is_empty() || self.classes.contains(&detection.class_id))
    }

    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| self.accepts(d))
            .map(|mut d| {
                if !self.tracking {
                    d.track_id = None;
                }
                d
            })
            .collect()
    }
}
