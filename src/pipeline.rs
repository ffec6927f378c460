//! Capture → detect → dedup → alert → broadcast orchestration.
//!
//! `Pipeline` is one worker's state and its per-frame `step`. `Orchestrator`
//! walks it through `Starting → Running → Stopping → Stopped`: it opens the
//! capture handle, runs `step` on a dedicated thread until the cooperative stop
//! flag is raised, then releases the capture handle and disconnects the bus.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::alert::AlertPublisher;
use crate::broadcast::Broadcaster;
use crate::detect::{DetectionFilter, Detector};
use crate::frame::{encode_jpeg, FrameSize};
use crate::ingest::{AcquisitionLoop, CaptureSource, DEFAULT_RETRY_INTERVAL_MS};
use crate::novelty::{NoveltyTracker, DEFAULT_TRACK_MEMORY};
use crate::sse::{ThreatCount, ViewerEvent, DEFAULT_RETRY_MS};

const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle of a running pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Stopped => "stopped",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => PipelineState::Starting,
            1 => PipelineState::Running,
            2 => PipelineState::Stopping,
            _ => PipelineState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PipelineState::Starting => 0,
            PipelineState::Running => 1,
            PipelineState::Stopping => 2,
            PipelineState::Stopped => 3,
        }
    }
}

/// Settings for one pipeline instance.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub filter: DetectionFilter,
    /// TrackMemory capacity.
    pub track_memory: usize,
    pub resize: Option<FrameSize>,
    /// Pause between consecutive failed reads after the first.
    pub retry_interval: Duration,
    /// Reconnect hint advertised to viewers.
    pub sse_retry_ms: u64,
    pub stats_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            filter: DetectionFilter::default(),
            track_memory: DEFAULT_TRACK_MEMORY,
            resize: None,
            retry_interval: Duration::from_millis(DEFAULT_RETRY_INTERVAL_MS),
            sse_retry_ms: DEFAULT_RETRY_MS,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

/// Snapshot of pipeline counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub capture_failures: u64,
    pub frames_skipped: u64,
    pub alerts_published: u64,
    pub events_broadcast: u64,
}

#[derive(Default)]
struct Shared {
    state: AtomicU8,
    frames_captured: AtomicU64,
    capture_failures: AtomicU64,
    frames_skipped: AtomicU64,
    alerts_published: AtomicU64,
    events_broadcast: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: PipelineState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
        log::info!("pipeline: {}", state.as_str());
    }

    fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            alerts_published: self.alerts_published.load(Ordering::Relaxed),
            events_broadcast: self.events_broadcast.load(Ordering::Relaxed),
        }
    }
}

/// Read-only view of a pipeline's state and counters, cheap to clone.
#[derive(Clone)]
pub struct StatusProbe {
    shared: Arc<Shared>,
}

impl StatusProbe {
    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> PipelineStats {
        self.shared.stats()
    }
}

/// Result of one `Pipeline::step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Capture failed; backoff already served.
    NoFrame,
    /// Detector gave no usable result; nothing was published or broadcast.
    Skipped,
    Processed {
        novel: bool,
        alerted: bool,
        delivered: usize,
    },
}

/// Worker-owned pipeline state.
pub struct Pipeline {
    acquisition: AcquisitionLoop,
    detector: Box<dyn Detector>,
    filter: DetectionFilter,
    tracker: NoveltyTracker,
    publisher: AlertPublisher,
    broadcaster: Arc<Broadcaster>,
    sse_retry_ms: u64,
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        source: Box<dyn CaptureSource>,
        detector: Box<dyn Detector>,
        publisher: AlertPublisher,
    ) -> Self {
        Self {
            acquisition: AcquisitionLoop::new(source, config.resize, config.retry_interval),
            detector,
            filter: config.filter.clone(),
            tracker: NoveltyTracker::new(config.track_memory),
            publisher,
            broadcaster: Arc::new(Broadcaster::new()),
            sse_retry_ms: config.sse_retry_ms,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    pub fn probe(&self) -> StatusProbe {
        StatusProbe {
            shared: self.shared.clone(),
        }
    }

    pub fn tracker(&self) -> &NoveltyTracker {
        &self.tracker
    }

    /// Open the capture handle. A failure here is not fatal: the first read
    /// fails and the acquisition loop re-opens.
    pub fn open(&mut self) {
        if let Err(err) = self.acquisition.open() {
            log::warn!(
                "pipeline: could not open {}: {:#}",
                self.acquisition.describe(),
                err
            );
        }
    }

    fn threat_count(&self) -> ThreatCount {
        if self.filter.tracking {
            ThreatCount::Known(self.tracker.novel_total())
        } else {
            ThreatCount::Unknown
        }
    }

    fn skip(&self) -> StepOutcome {
        self.shared.frames_skipped.fetch_add(1, Ordering::Relaxed);
        StepOutcome::Skipped
    }

    /// One iteration: acquire, detect, filter, novelty, alert, broadcast.
    pub fn step(&mut self) -> StepOutcome {
        let Some(frame) = self.acquisition.acquire() else {
            self.shared.capture_failures.fetch_add(1, Ordering::Relaxed);
            return StepOutcome::NoFrame;
        };
        self.shared.frames_captured.fetch_add(1, Ordering::Relaxed);

        let output = match self.detector.detect(&frame) {
            Ok(Some(output)) => output,
            Ok(None) => {
                log::debug!("pipeline: detector returned no result for frame {}", frame.sequence());
                return self.skip();
            }
            Err(err) => {
                log::warn!("pipeline: detector failed on frame {}: {:#}", frame.sequence(), err);
                return self.skip();
            }
        };
        if output.annotated.width() == 0 || output.annotated.height() == 0 {
            log::warn!("pipeline: detector returned an empty image for frame {}", frame.sequence());
            return self.skip();
        }

        let detections = self.filter.apply(output.detections);
        let novel = self.tracker.update(&detections);

        let annotated_jpeg = match encode_jpeg(&output.annotated) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::warn!("pipeline: {:#}", err);
                return self.skip();
            }
        };

        let alerted = self
            .publisher
            .publish_if_novel(novel, frame.image(), &annotated_jpeg);
        if alerted {
            self.shared.alerts_published.fetch_add(1, Ordering::Relaxed);
        }

        let event = ViewerEvent {
            annotated_image: annotated_jpeg,
            threat_count: self.threat_count(),
            inference_ms: output.inference_ms,
        };
        let wire = match event.to_wire(self.sse_retry_ms) {
            Ok(wire) => wire,
            Err(err) => {
                log::warn!("pipeline: could not frame viewer event: {:#}", err);
                return self.skip();
            }
        };
        let delivered = self.broadcaster.broadcast(wire);
        self.shared.events_broadcast.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "pipeline: frame {} detections={} novel={} delivered={}",
            frame.sequence(),
            detections.len(),
            novel,
            delivered
        );

        StepOutcome::Processed {
            novel,
            alerted,
            delivered,
        }
    }

    /// Release the capture handle and disconnect the bus.
    pub fn shutdown(self) -> Result<()> {
        let Pipeline {
            mut acquisition,
            publisher,
            ..
        } = self;
        acquisition.release();
        publisher.shutdown()
    }
}

/// Owns the pipeline lifecycle.
pub struct Orchestrator {
    pipeline: Pipeline,
    stats_interval: Duration,
}

impl Orchestrator {
    /// Build a pipeline in the `Starting` state. Nothing runs until `start`.
    pub fn new(
        config: &PipelineConfig,
        source: Box<dyn CaptureSource>,
        detector: Box<dyn Detector>,
        publisher: AlertPublisher,
    ) -> Self {
        let pipeline = Pipeline::new(config, source, detector, publisher);
        pipeline.shared.set_state(PipelineState::Starting);
        Self {
            pipeline,
            stats_interval: config.stats_interval,
        }
    }

    /// Subscriber registry for the viewer server.
    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.pipeline.broadcaster()
    }

    pub fn probe(&self) -> StatusProbe {
        self.pipeline.probe()
    }

    /// Open the capture handle, warm up the detector and spawn the worker.
    pub fn start(self) -> Result<PipelineHandle> {
        let Orchestrator {
            mut pipeline,
            stats_interval,
        } = self;
        log::info!(
            "pipeline: starting with source={} detector={} alerts={}",
            pipeline.acquisition.describe(),
            pipeline.detector.name(),
            if pipeline.publisher.is_enabled() { "mqtt" } else { "disabled" }
        );
        pipeline.detector.warm_up()?;
        pipeline.open();

        let stop = Arc::new(AtomicBool::new(false));
        let broadcaster = pipeline.broadcaster();
        let probe = pipeline.probe();
        let worker = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("pipeline-worker".to_string())
                .spawn(move || run_worker(pipeline, &stop, stats_interval))?
        };

        Ok(PipelineHandle {
            broadcaster,
            probe,
            stop,
            worker: Some(worker),
        })
    }
}

fn run_worker(mut pipeline: Pipeline, stop: &AtomicBool, stats_interval: Duration) -> Result<()> {
    pipeline.shared.set_state(PipelineState::Running);
    let mut last_stats = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        pipeline.step();

        if last_stats.elapsed() >= stats_interval {
            let stats = pipeline.shared.stats();
            log::info!(
                "pipeline: frames={} failures={} skipped={} alerts={} subscribers={} novel_total={}",
                stats.frames_captured,
                stats.capture_failures,
                stats.frames_skipped,
                stats.alerts_published,
                pipeline.broadcaster.subscriber_count(),
                pipeline.tracker.novel_total()
            );
            last_stats = Instant::now();
        }
    }
    let shared = pipeline.shared.clone();
    let result = pipeline.shutdown();
    shared.set_state(PipelineState::Stopped);
    result
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    broadcaster: Arc<Broadcaster>,
    probe: StatusProbe,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl PipelineHandle {
    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    pub fn probe(&self) -> StatusProbe {
        self.probe.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.probe.state()
    }

    pub fn stats(&self) -> PipelineStats {
        self.probe.stats()
    }

    /// True while the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Raise the stop flag and wait for the worker to finish its current
    /// iteration, release the capture handle and disconnect the bus.
    pub fn stop(mut self) -> Result<()> {
        if self.probe.state() != PipelineState::Stopped {
            self.probe.shared.set_state(PipelineState::Stopping);
        }
        self.stop.store(true, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let outcome = worker.join();
        self.probe.shared.state.store(PipelineState::Stopped.as_u8(), Ordering::SeqCst);
        outcome.map_err(|_| anyhow!("pipeline worker thread panicked"))?
    }
}
