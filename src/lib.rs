//! Frame Sentry
//!
//! Camera frame pipeline that detects objects, deduplicates them by tracker id,
//! publishes an alert for every newly seen object and streams annotated frames
//! to browser viewers.
//!
//! # Architecture
//!
//! One worker thread owns the whole per-frame path:
//!
//! 1. **Acquire**: read a frame, re-opening the capture source on failure.
//! 2. **Detect**: run the detector backend and filter its detections.
//! 3. **Dedup**: decide novelty against a bounded FIFO of recent track ids.
//! 4. **Alert**: publish raw and annotated JPEGs on the message bus when novel.
//! 5. **Broadcast**: fan the annotated frame out to every connected viewer.
//!
//! Viewers are served by a separate HTTP server; each holds its own unbounded
//! inbox so a slow browser never stalls capture or its peers.
//!
//! # Module Structure
//!
//! - `frame`: captured frames, resize targets, JPEG encoding
//! - `ingest`: capture sources and the acquisition retry loop
//! - `detect`: detector backends and detection filtering
//! - `novelty`: track-id memory and novelty decisions
//! - `sse`: viewer event payload and event-stream framing
//! - `broadcast`: multi-subscriber fan-out
//! - `alert`: alert payloads and the MQTT bus
//! - `pipeline`: per-frame step and lifecycle orchestration
//! - `api`: viewer HTTP server
//! - `config`: daemon configuration

pub mod alert;
pub mod api;
pub mod broadcast;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod novelty;
pub mod pipeline;
pub mod sse;

pub use alert::{AlertEvent, AlertPublisher, MessageBus, MqttBus, MqttSettings, Qos};
pub use api::{ServerHandle, ViewerServer, ViewerServerConfig};
pub use broadcast::{Broadcaster, Receive, SubscriberId, Subscription, WireEvent};
pub use config::SentryConfig;
pub use detect::{build_detector, Detection, DetectionFilter, Detector, DetectorOutput};
pub use frame::{encode_jpeg, Frame, FrameSize};
pub use ingest::{open_source, AcquisitionLoop, CaptureConfig, CaptureSource, SyntheticSource};
pub use novelty::{NoveltyTracker, TrackMemory};
pub use pipeline::{
    Orchestrator, Pipeline, PipelineConfig, PipelineHandle, PipelineState, PipelineStats,
    StatusProbe, StepOutcome,
};
pub use sse::{format_event, ThreatCount, ViewerEvent};
