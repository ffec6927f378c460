//! Frame capture.
//!
//! This module provides the capture handle abstraction and its sources:
//! - Synthetic source (`stub://<name>`), always available
//! - GStreamer source for devices, files and stream URLs (feature: capture-gstreamer)
//!
//! `AcquisitionLoop` wraps a source with the re-open/backoff policy the
//! pipeline worker relies on.

mod acquire;
#[cfg(feature = "capture-gstreamer")]
mod gst;
mod synthetic;

use anyhow::Result;

use crate::frame::{Frame, FrameSize};

pub use acquire::{AcquisitionLoop, AcquisitionStats};
#[cfg(feature = "capture-gstreamer")]
pub use gst::GstreamerSource;
pub use synthetic::SyntheticSource;

/// Default pause between consecutive failed reads after the first.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 2_000;

/// Capture handle: open, read one frame, release.
///
/// `read` returning `Ok(None)` or `Err(_)` are both "no frame" to the
/// acquisition loop; the error variant only carries extra detail for logs.
pub trait CaptureSource: Send {
    /// Human-readable source identifier for logs.
    fn describe(&self) -> String;

    /// Open or re-open the handle. Safe to call on an already open handle.
    fn open(&mut self) -> Result<()>;

    /// Read the next frame, blocking until one is available or the source gives up.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Release the handle. Further reads fail until `open` is called again.
    fn release(&mut self);
}

/// Capture settings consumed by `open_source`.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureConfig {
    /// Source identifier: `stub://name`, a device path, a file path or a URL.
    pub source: String,
    /// Optional resize target applied to every frame.
    pub resize: Option<FrameSize>,
    /// Nominal frame rate; paces synthetic sources and bounds pull timeouts.
    pub target_fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: "/dev/video0".to_string(),
            resize: None,
            target_fps: 10,
        }
    }
}

/// Pick a capture source for `config.source`.
pub fn open_source(config: &CaptureConfig) -> Result<Box<dyn CaptureSource>> {
    if config.source.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())));
    }
    #[cfg(feature = "capture-gstreamer")]
    {
        Ok(Box::new(GstreamerSource::new(config.clone())?))
    }
    #[cfg(not(feature = "capture-gstreamer"))]
    {
        anyhow::bail!(
            "capture source '{}' requires the capture-gstreamer feature",
            config.source
        )
    }
}
