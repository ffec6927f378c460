use std::time::Duration;

use super::CaptureSource;
use crate::frame::{Frame, FrameSize};

/// Counters kept by the acquisition loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcquisitionStats {
    pub frames: u64,
    pub failures: u64,
    pub reopens: u64,
}

/// Pulls frames from a capture source with the re-open/backoff policy.
///
/// On a failed read the handle is re-opened. The first consecutive failure
/// retries immediately; every further consecutive failure sleeps
/// `retry_interval` before returning. One successful read resets the policy.
pub struct AcquisitionLoop {
    source: Box<dyn CaptureSource>,
    resize: Option<FrameSize>,
    retry_interval: Duration,
    retry_pause: bool,
    consecutive_failures: u64,
    stats: AcquisitionStats,
}

impl AcquisitionLoop {
    pub fn new(
        source: Box<dyn CaptureSource>,
        resize: Option<FrameSize>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            source,
            resize,
            retry_interval,
            retry_pause: false,
            consecutive_failures: 0,
            stats: AcquisitionStats::default(),
        }
    }

    /// Open the underlying handle.
    pub fn open(&mut self) -> anyhow::Result<()> {
        self.source.open()
    }

    /// One acquisition attempt. `None` means the attempt failed and the
    /// backoff for this failure has already been served.
    pub fn acquire(&mut self) -> Option<Frame> {
        let outcome = match self.source.read() {
            Ok(frame) => frame,
            Err(err) => {
                log::debug!("capture: read from {} failed: {:#}", self.source.describe(), err);
                None
            }
        };

        if let Some(frame) = outcome {
            if self.consecutive_failures > 0 {
                log::info!(
                    "capture: {} recovered after {} failed reads",
                    self.source.describe(),
                    self.consecutive_failures
                );
            }
            self.retry_pause = false;
            self.consecutive_failures = 0;
            self.stats.frames += 1;
            return Some(frame.resized(self.resize));
        }

        self.consecutive_failures += 1;
        self.stats.failures += 1;
        log::info!(
            "capture: {} did not return a frame (consecutive failures: {})",
            self.source.describe(),
            self.consecutive_failures
        );

        self.stats.reopens += 1;
        if let Err(err) = self.source.open() {
            log::warn!("capture: re-open of {} failed: {:#}", self.source.describe(), err);
        }

        if self.retry_pause {
            std::thread::sleep(self.retry_interval);
        } else {
            self.retry_pause = true;
        }
        None
    }

    pub fn stats(&self) -> AcquisitionStats {
        self.stats
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    /// Release the capture handle.
    pub fn release(&mut self) {
        self.source.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    enum Step {
        Frame,
        Empty,
        Error,
    }

    struct ScriptedSource {
        steps: VecDeque<Step>,
        opens: Arc<AtomicUsize>,
        sequence: u64,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>, opens: Arc<AtomicUsize>) -> Self {
            Self {
                steps: steps.into(),
                opens,
                sequence: 0,
            }
        }
    }

    impl CaptureSource for ScriptedSource {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        fn open(&mut self) -> Result<()> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn read(&mut self) -> Result<Option<Frame>> {
            match self.steps.pop_front() {
                Some(Step::Frame) => {
                    self.sequence += 1;
                    Frame::from_rgb(4, 4, vec![0u8; 48], self.sequence).map(Some)
                }
                Some(Step::Empty) | None => Ok(None),
                Some(Step::Error) => Err(anyhow!("device unplugged")),
            }
        }

        fn release(&mut self) {}
    }

    const INTERVAL: Duration = Duration::from_millis(200);

    #[test]
    fn first_failure_retries_without_delay() {
        let opens = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource::new(vec![Step::Frame, Step::Empty], opens.clone());
        let mut acq = AcquisitionLoop::new(Box::new(source), None, INTERVAL);

        assert!(acq.acquire().is_some());

        let started = Instant::now();
        assert!(acq.acquire().is_none());
        assert!(started.elapsed() < INTERVAL / 2);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_consecutive_failure_waits_for_interval() {
        let opens = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource::new(vec![Step::Empty, Step::Error, Step::Empty], opens.clone());
        let mut acq = AcquisitionLoop::new(Box::new(source), None, INTERVAL);

        assert!(acq.acquire().is_none());

        let started = Instant::now();
        assert!(acq.acquire().is_none());
        assert!(started.elapsed() >= INTERVAL);

        let started = Instant::now();
        assert!(acq.acquire().is_none());
        assert!(started.elapsed() >= INTERVAL);

        assert_eq!(opens.load(Ordering::SeqCst), 3);
        let stats = acq.stats();
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.reopens, 3);
        assert_eq!(stats.frames, 0);
    }

    #[test]
    fn success_resets_backoff() {
        let opens = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource::new(
            vec![Step::Empty, Step::Frame, Step::Empty],
            opens.clone(),
        );
        let mut acq = AcquisitionLoop::new(Box::new(source), None, INTERVAL);

        assert!(acq.acquire().is_none());
        assert!(acq.acquire().is_some());

        let started = Instant::now();
        assert!(acq.acquire().is_none());
        assert!(started.elapsed() < INTERVAL / 2);
    }

    #[test]
    fn frames_are_resized() {
        let opens = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource::new(vec![Step::Frame], opens);
        let mut acq =
            AcquisitionLoop::new(Box::new(source), Some(FrameSize::new(2, 2)), INTERVAL);
        let frame = acq.acquire().expect("frame");
        assert_eq!((frame.width(), frame.height()), (2, 2));
    }
}
