use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use serde_json::Value;

use frame_sentry::{
    AlertPublisher, CaptureSource, Detection, DetectionFilter, Detector, DetectorOutput, Frame,
    MessageBus, Orchestrator, Pipeline, PipelineConfig, PipelineState, Qos, Receive,
    StepOutcome, WireEvent,
};

/// Serves frames forever, or fails the reads listed in `fail_reads`.
struct ScriptedSource {
    sequence: u64,
    fail_reads: VecDeque<bool>,
    released: Arc<AtomicBool>,
}

impl ScriptedSource {
    fn new(fail_reads: &[bool]) -> (Self, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let source = Self {
            sequence: 0,
            fail_reads: fail_reads.iter().copied().collect(),
            released: released.clone(),
        };
        (source, released)
    }
}

impl CaptureSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.fail_reads.pop_front().unwrap_or(false) {
            return Err(anyhow!("camera unplugged"));
        }
        std::thread::sleep(Duration::from_millis(2));
        self.sequence += 1;
        let shade = (self.sequence % 255) as u8;
        Ok(Some(Frame::new(
            RgbImage::from_pixel(16, 12, Rgb([shade, 0, 0])),
            self.sequence,
        )))
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

enum Scripted {
    Detections(Vec<Detection>),
    Fail,
    Nothing,
}

/// Replays one scripted result per frame, then repeats the last one.
struct ScriptedDetector {
    script: VecDeque<Scripted>,
    last: Vec<Detection>,
}

impl ScriptedDetector {
    fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: script.into(),
            last: Vec::new(),
        }
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Option<DetectorOutput>> {
        match self.script.pop_front() {
            Some(Scripted::Fail) => return Err(anyhow!("inference crashed")),
            Some(Scripted::Nothing) => return Ok(None),
            Some(Scripted::Detections(detections)) => self.last = detections,
            None => {}
        }
        Ok(Some(DetectorOutput {
            detections: self.last.clone(),
            annotated: frame.image().clone(),
            inference_ms: Some(12.341),
        }))
    }
}

type Published = Arc<Mutex<Vec<(String, Vec<u8>, Qos)>>>;

struct RecordingBus {
    published: Published,
    disconnected: Arc<AtomicBool>,
}

impl MessageBus for RecordingBus {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload, qos));
        Ok(())
    }

    fn disconnect(self: Box<Self>) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn recording_publisher() -> (AlertPublisher, Published, Arc<AtomicBool>) {
    let published = Published::default();
    let disconnected = Arc::new(AtomicBool::new(false));
    let bus = RecordingBus {
        published: published.clone(),
        disconnected: disconnected.clone(),
    };
    (
        AlertPublisher::configured(Box::new(bus), "sentry/alerts"),
        published,
        disconnected,
    )
}

fn config(track_memory: usize) -> PipelineConfig {
    PipelineConfig {
        track_memory,
        retry_interval: Duration::from_millis(20),
        ..PipelineConfig::default()
    }
}

fn tracked(ids: &[i64]) -> Scripted {
    Scripted::Detections(ids.iter().map(|id| Detection::tracked(0, *id, 0.9)).collect())
}

/// Pull the JSON payload out of a framed viewer event.
fn payload(event: &WireEvent) -> Value {
    let text = std::str::from_utf8(event).unwrap();
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .unwrap();
    serde_json::from_str(data).unwrap()
}

fn processed(novel: bool, alerted: bool, delivered: usize) -> StepOutcome {
    StepOutcome::Processed {
        novel,
        alerted,
        delivered,
    }
}

#[test]
fn repeated_track_id_alerts_once_and_streams_every_frame() -> Result<()> {
    let (source, _) = ScriptedSource::new(&[]);
    let detector = ScriptedDetector::new(vec![tracked(&[42]), tracked(&[42])]);
    let (publisher, published, _) = recording_publisher();
    let mut pipeline = Pipeline::new(&config(10), Box::new(source), Box::new(detector), publisher);
    let viewer = pipeline.broadcaster().register()?;

    pipeline.open();
    assert_eq!(pipeline.step(), processed(true, true, 1));
    assert_eq!(pipeline.step(), processed(false, false, 1));

    assert_eq!(published.lock().unwrap().len(), 1);
    assert_eq!(published.lock().unwrap()[0].0, "sentry/alerts");
    assert_eq!(published.lock().unwrap()[0].2, Qos::AtLeastOnce);
    assert_eq!(viewer.pending(), 2);
    for _ in 0..2 {
        let event = viewer.receive().unwrap();
        assert!(event.starts_with(b"retry: 500\nevent: image\ndata: "));
        let json = payload(&event);
        assert_eq!(json["threatcount"], 1);
        assert_eq!(json["inference"], 12.35);
    }
    assert_eq!(pipeline.tracker().novel_total(), 1);
    Ok(())
}

#[test]
fn evicted_id_is_novel_again_with_small_memory() -> Result<()> {
    let (source, _) = ScriptedSource::new(&[]);
    let detector = ScriptedDetector::new(vec![tracked(&[1]), tracked(&[2]), tracked(&[1])]);
    let (publisher, published, _) = recording_publisher();
    let mut pipeline = Pipeline::new(&config(1), Box::new(source), Box::new(detector), publisher);
    let viewer = pipeline.broadcaster().register()?;

    for _ in 0..3 {
        assert_eq!(pipeline.step(), processed(true, true, 1));
    }
    assert_eq!(published.lock().unwrap().len(), 3);
    let counts: Vec<Value> = (0..3)
        .map(|_| payload(&viewer.receive().unwrap())["threatcount"].clone())
        .collect();
    assert_eq!(counts, vec![Value::from(1), Value::from(2), Value::from(3)]);
    Ok(())
}

#[test]
fn detector_failures_skip_the_frame() -> Result<()> {
    let (source, _) = ScriptedSource::new(&[]);
    let detector = ScriptedDetector::new(vec![
        Scripted::Fail,
        Scripted::Nothing,
        tracked(&[7]),
    ]);
    let (publisher, published, _) = recording_publisher();
    let mut pipeline = Pipeline::new(&config(10), Box::new(source), Box::new(detector), publisher);
    let viewer = pipeline.broadcaster().register()?;

    assert_eq!(pipeline.step(), StepOutcome::Skipped);
    assert_eq!(pipeline.step(), StepOutcome::Skipped);
    assert_eq!(viewer.pending(), 0);
    assert!(published.lock().unwrap().is_empty());

    assert_eq!(pipeline.step(), processed(true, true, 1));
    assert_eq!(pipeline.probe().stats().frames_skipped, 2);
    assert_eq!(pipeline.probe().stats().events_broadcast, 1);
    Ok(())
}

#[test]
fn untracked_detections_alert_on_presence_with_unknown_count() -> Result<()> {
    let (source, _) = ScriptedSource::new(&[]);
    let detector = ScriptedDetector::new(vec![
        tracked(&[5]),
        Scripted::Detections(Vec::new()),
        tracked(&[5]),
    ]);
    let (publisher, published, _) = recording_publisher();
    let config = PipelineConfig {
        filter: DetectionFilter {
            tracking: false,
            ..DetectionFilter::default()
        },
        ..config(10)
    };
    let mut pipeline = Pipeline::new(&config, Box::new(source), Box::new(detector), publisher);
    let viewer = pipeline.broadcaster().register()?;

    assert_eq!(pipeline.step(), processed(true, true, 1));
    assert_eq!(pipeline.step(), processed(false, false, 1));
    assert_eq!(pipeline.step(), processed(true, true, 1));
    assert_eq!(published.lock().unwrap().len(), 2);
    assert_eq!(payload(&viewer.receive().unwrap())["threatcount"], "unknown");
    Ok(())
}

#[test]
fn low_confidence_and_uninteresting_classes_are_ignored() -> Result<()> {
    let (source, _) = ScriptedSource::new(&[]);
    let detector = ScriptedDetector::new(vec![
        Scripted::Detections(vec![Detection::tracked(0, 1, 0.1)]),
        Scripted::Detections(vec![Detection::tracked(3, 2, 0.9)]),
        Scripted::Detections(vec![Detection::tracked(0, 3, 0.9)]),
    ]);
    let (publisher, published, _) = recording_publisher();
    let config = PipelineConfig {
        filter: DetectionFilter {
            classes: vec![0],
            ..DetectionFilter::default()
        },
        ..config(10)
    };
    let mut pipeline = Pipeline::new(&config, Box::new(source), Box::new(detector), publisher);

    assert_eq!(pipeline.step(), processed(false, false, 0));
    assert_eq!(pipeline.step(), processed(false, false, 0));
    assert_eq!(pipeline.step(), processed(true, true, 0));
    assert_eq!(published.lock().unwrap().len(), 1);
    Ok(())
}

#[test]
fn capture_failures_produce_no_frame_and_recover() -> Result<()> {
    let (source, _) = ScriptedSource::new(&[true, true]);
    let detector = ScriptedDetector::new(vec![tracked(&[9])]);
    let mut pipeline = Pipeline::new(
        &config(10),
        Box::new(source),
        Box::new(detector),
        AlertPublisher::disabled(),
    );

    assert_eq!(pipeline.step(), StepOutcome::NoFrame);
    assert_eq!(pipeline.step(), StepOutcome::NoFrame);
    assert_eq!(pipeline.step(), processed(true, false, 0));
    assert_eq!(pipeline.probe().stats().capture_failures, 2);
    assert_eq!(pipeline.probe().stats().alerts_published, 0);
    Ok(())
}

#[test]
fn orchestrator_runs_until_stopped_and_releases_resources() -> Result<()> {
    let (source, released) = ScriptedSource::new(&[]);
    let detector = ScriptedDetector::new(vec![tracked(&[1])]);
    let (publisher, published, disconnected) = recording_publisher();
    let orchestrator =
        Orchestrator::new(&config(10), Box::new(source), Box::new(detector), publisher);
    assert_eq!(orchestrator.probe().state(), PipelineState::Starting);
    let viewer = orchestrator.broadcaster().register()?;

    let handle = orchestrator.start()?;
    match viewer.receive_timeout(Duration::from_secs(5)) {
        Receive::Event(event) => assert_eq!(payload(&event)["threatcount"], 1),
        other => panic!("expected a viewer event, got {:?}", other),
    }
    assert!(handle.is_running());
    assert_eq!(handle.state(), PipelineState::Running);

    let probe = handle.probe();
    handle.stop()?;
    assert_eq!(probe.state(), PipelineState::Stopped);
    assert!(released.load(Ordering::SeqCst));
    assert!(disconnected.load(Ordering::SeqCst));
    assert_eq!(published.lock().unwrap().len(), 1);
    assert!(probe.stats().frames_captured >= 1);
    Ok(())
}
