mod backend;
mod backends;
mod filter;
mod result;

pub use backend::Detector;
pub use backends::{build_detector, MotionDetector, DEFAULT_DETECTOR, MOTION_CLASS_ID};
pub use filter::{DetectionFilter, DEFAULT_CONFIDENCE_THRESHOLD};
pub use result::{Detection, DetectorOutput};
