use anyhow::Result;

use crate::detect::result::DetectorOutput;
use crate::frame::Frame;

/// Detector backend trait.
///
/// Backends run on the pipeline worker thread only. `detect` may block for
/// the duration of inference.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    ///
    /// `Ok(None)` means the backend produced no usable result for this frame;
    /// the pipeline skips the frame just as it does for `Err`.
    fn detect(&mut self, frame: &Frame) -> Result<Option<DetectorOutput>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
