//! GStreamer capture source.
//!
//! Builds one of:
//! - `v4l2src device=<path>` for `/dev/video*` devices
//! - `uridecodebin uri=<url>` for anything with a URL scheme (rtsp://, http://, file://)
//! - `filesrc location=<path> ! decodebin` for plain file paths
//!
//! each followed by `videoconvert ! video/x-raw,format=RGB ! appsink`.
//! Re-opening tears the pipeline down and builds a fresh one, which is how a
//! vanished USB camera or a dropped stream gets picked up again.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use super::{CaptureConfig, CaptureSource};
use crate::frame::Frame;

pub struct GstreamerSource {
    config: CaptureConfig,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
    frame_count: u64,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            pipeline: None,
            frame_count: 0,
            last_error: None,
        })
    }

    fn pipeline_description(&self) -> String {
        let source = &self.config.source;
        let head = if source.starts_with("/dev/") {
            format!("v4l2src device={}", source)
        } else if source.contains("://") {
            format!("uridecodebin uri={}", source)
        } else {
            format!("filesrc location={} ! decodebin", source)
        };
        format!(
            "{} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            head
        )
    }

    fn build(&self) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
        let pipeline = gstreamer::parse::launch(&self.pipeline_description())
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set capture pipeline to Playing")?;
        Ok((pipeline, appsink))
    }

    fn pull_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps as u64).saturating_mul(4)
        };
        gstreamer::ClockTime::from_mseconds(base_ms.max(500))
    }

    fn poll_bus(&mut self) {
        let Some((pipeline, _)) = &self.pipeline else {
            return;
        };
        let Some(bus) = pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached end of stream".to_string());
                }
                _ => {}
            }
        }
    }
}

impl CaptureSource for GstreamerSource {
    fn describe(&self) -> String {
        self.config.source.clone()
    }

    fn open(&mut self) -> Result<()> {
        self.release();
        self.last_error = None;
        let built = self.build()?;
        self.pipeline = Some(built);
        log::info!("capture: opened {}", self.config.source);
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if let Some(err) = self.last_error.take() {
            return Err(anyhow!(err));
        }
        let timeout = self.pull_timeout();
        let Some((_, appsink)) = &self.pipeline else {
            return Err(anyhow!("capture source {} is not open", self.config.source));
        };
        let Some(sample) = appsink.try_pull_sample(timeout) else {
            return Ok(None);
        };
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        Frame::from_rgb(width, height, pixels, self.frame_count).map(Some)
    }

    fn release(&mut self) {
        if let Some((pipeline, _)) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("capture: failed to stop pipeline for {}: {}", self.config.source, err);
            }
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("capture sample missing buffer")?;
    let caps = sample.caps().context("capture sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse capture caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map capture buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("capture buffer shorter than frame")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("capture buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
