mod motion;

use anyhow::{anyhow, Result};

use crate::detect::backend::Detector;

pub use motion::{MotionDetector, MOTION_CLASS_ID};

/// Backend used when none is configured.
pub const DEFAULT_DETECTOR: &str = "motion";

/// Resolve a detector backend by name.
pub fn build_detector(name: &str) -> Result<Box<dyn Detector>> {
    match name {
        "motion" => Ok(Box::new(MotionDetector::new())),
        other => Err(anyhow!(
            "unknown detector backend '{}' (available: motion)",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_backends_only() {
        assert_eq!(build_detector("motion").unwrap().name(), "motion");
        assert!(build_detector("yolo").is_err());
    }
}
