use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::alert::{MqttSettings, DEFAULT_MQTT_CLIENT_ID, DEFAULT_MQTT_PORT};
use crate::detect::{DetectionFilter, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_DETECTOR};
use crate::frame::FrameSize;
use crate::ingest::{CaptureConfig, DEFAULT_RETRY_INTERVAL_MS};
use crate::novelty::DEFAULT_TRACK_MEMORY;
use crate::pipeline::PipelineConfig;
use crate::sse::DEFAULT_RETRY_MS;

const DEFAULT_HTTP_HOST: &str = "0.0.0.0";
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_CAMERA: &str = "/dev/video0";
const DEFAULT_TARGET_FPS: u32 = 10;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SentryConfigFile {
    http_addr: Option<String>,
    docroot: Option<PathBuf>,
    capture: Option<CaptureConfigFile>,
    detector: Option<DetectorConfigFile>,
    tracking: Option<TrackingConfigFile>,
    mqtt: Option<MqttConfigFile>,
    sse: Option<SseConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<String>,
    frame_size: Option<String>,
    target_fps: Option<u32>,
    retry_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    confidence: Option<f32>,
    classes: Option<Vec<u32>>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    enabled: Option<bool>,
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    server: Option<String>,
    port: Option<u16>,
    topic: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    use_tls: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct SseConfigFile {
    retry_ms: Option<u64>,
}

/// Broker settings as collected from file and environment. A bus is only
/// configured when both `server` and `topic` end up set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MqttOverrides {
    pub server: Option<String>,
    pub port: u16,
    pub topic: Option<String>,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

#[derive(Debug, Clone)]
pub struct SentryConfig {
    pub http_addr: String,
    pub docroot: Option<PathBuf>,
    pub capture: CaptureConfig,
    pub retry_interval: Duration,
    pub detector: String,
    pub filter: DetectionFilter,
    pub track_memory: usize,
    pub mqtt: MqttOverrides,
    pub sse_retry_ms: u64,
}

impl SentryConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SENTRY_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load with an explicit config file path instead of `SENTRY_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentryConfigFile) -> Result<Self> {
        let capture_file = file.capture.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();
        let tracking_file = file.tracking.unwrap_or_default();
        let mqtt_file = file.mqtt.unwrap_or_default();

        let resize = match capture_file.frame_size.as_deref() {
            Some(size) => parse_resize(size)?,
            None => None,
        };
        let capture = CaptureConfig {
            source: capture_file
                .source
                .unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
            resize,
            target_fps: capture_file.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
        };
        let filter = DetectionFilter {
            min_confidence: detector_file
                .confidence
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            classes: detector_file.classes.unwrap_or_default(),
            tracking: tracking_file.enabled.unwrap_or(true),
        };
        let mqtt = MqttOverrides {
            server: mqtt_file.server,
            port: mqtt_file.port.unwrap_or(DEFAULT_MQTT_PORT),
            topic: mqtt_file.topic,
            client_id: mqtt_file
                .client_id
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
            username: mqtt_file.username,
            password: mqtt_file.password,
            use_tls: mqtt_file.use_tls.unwrap_or(false),
        };
        Ok(Self {
            http_addr: file
                .http_addr
                .unwrap_or_else(|| format!("{}:{}", DEFAULT_HTTP_HOST, DEFAULT_HTTP_PORT)),
            docroot: file.docroot,
            capture,
            retry_interval: Duration::from_millis(
                capture_file
                    .retry_interval_ms
                    .unwrap_or(DEFAULT_RETRY_INTERVAL_MS),
            ),
            detector: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            filter,
            track_memory: tracking_file.capacity.unwrap_or(DEFAULT_TRACK_MEMORY),
            mqtt,
            sse_retry_ms: file
                .sse
                .and_then(|sse| sse.retry_ms)
                .unwrap_or(DEFAULT_RETRY_MS),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = env_parsed::<u16>("PORT")? {
            self.http_addr = with_port(&self.http_addr, port);
        }
        if let Some(addr) = env_value("SENTRY_HTTP_ADDR") {
            self.http_addr = addr;
        }
        if let Some(docroot) = env_value("DOCROOT") {
            self.docroot = Some(PathBuf::from(docroot));
        }
        if let Some(camera) = env_value("CAMERA") {
            self.capture.source = camera;
        }
        if let Some(size) = env_value("FRAME_SIZE") {
            self.capture.resize = parse_resize(&size)?;
        }
        if let Some(interval) = env_parsed::<u64>("RETRY_INTERVAL_MS")? {
            self.retry_interval = Duration::from_millis(interval);
        }
        if let Some(detector) = env_value("DETECTOR") {
            self.detector = detector;
        }
        if let Some(classes) = env_value("INTERESTED_CLASSES") {
            self.filter.classes = split_csv(&classes)
                .iter()
                .map(|entry| {
                    entry.parse::<u32>().map_err(|_| {
                        anyhow!("INTERESTED_CLASSES entry '{}' is not a class id", entry)
                    })
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(confidence) = env_parsed::<f32>("CONFIDENCE")? {
            self.filter.min_confidence = confidence;
        }
        if let Some(tracking) = env_value("TRACKING") {
            self.filter.tracking = parse_bool("TRACKING", &tracking)?;
        }
        if let Some(capacity) = env_parsed::<usize>("DEDUP_CAPACITY")? {
            self.track_memory = capacity;
        }
        if let Some(server) = env_value("MQTT_SERVER") {
            self.mqtt.server = Some(server);
        }
        if let Some(port) = env_parsed::<u16>("MQTT_PORT")? {
            self.mqtt.port = port;
        }
        if let Some(topic) = env_value("MQTT_TOPIC") {
            self.mqtt.topic = Some(topic);
        }
        if let Some(client_id) = env_value("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Some(username) = env_value("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = env_value("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(use_tls) = env_value("MQTT_USE_TLS") {
            self.mqtt.use_tls = parse_bool("MQTT_USE_TLS", &use_tls)?;
        }
        if let Some(retry) = env_parsed::<u64>("SSE_RETRY_MS")? {
            self.sse_retry_ms = retry;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.filter.min_confidence) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                self.filter.min_confidence
            ));
        }
        if self.track_memory == 0 {
            return Err(anyhow!("dedup capacity must be greater than zero"));
        }
        if self.capture.source.trim().is_empty() {
            return Err(anyhow!("capture source must not be empty"));
        }
        if self.capture.target_fps == 0 {
            return Err(anyhow!("capture target_fps must be greater than zero"));
        }
        if self.mqtt.port == 0 {
            return Err(anyhow!("mqtt port must be greater than zero"));
        }
        if self.mqtt.topic.as_deref().is_some_and(|t| t.contains(['+', '#'])) {
            return Err(anyhow!("mqtt topic must not contain wildcards"));
        }
        self.http_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("invalid http address '{}': {}", self.http_addr, e))?;
        if let Some(server) = self.mqtt.server.take() {
            let (host, tls) = split_scheme(&server)?;
            self.mqtt.server = Some(host);
            self.mqtt.use_tls |= tls;
        }
        Ok(())
    }

    /// Broker settings, when both a server and a topic are configured.
    pub fn mqtt_settings(&self) -> Option<MqttSettings> {
        let host = self.mqtt.server.clone()?;
        let topic = self.mqtt.topic.clone()?;
        Some(MqttSettings {
            host,
            port: self.mqtt.port,
            topic,
            client_id: self.mqtt.client_id.clone(),
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            use_tls: self.mqtt.use_tls,
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            filter: self.filter.clone(),
            track_memory: self.track_memory,
            resize: self.capture.resize,
            retry_interval: self.retry_interval,
            sse_retry_ms: self.sse_retry_ms,
            ..PipelineConfig::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<SentryConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env_value(key) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, value)),
        None => Ok(None),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{} must be a boolean, got '{}'", key, value)),
    }
}

fn parse_resize(value: &str) -> Result<Option<FrameSize>> {
    let size: FrameSize = value.parse()?;
    Ok((!size.is_unset()).then_some(size))
}

fn with_port(addr: &str, port: u16) -> String {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
    format!("{}:{}", host, port)
}

/// Strip an `mqtt://` or `mqtts://` prefix. Returns the host and whether TLS
/// was requested.
fn split_scheme(server: &str) -> Result<(String, bool)> {
    let (host, tls) = match server.split_once("://") {
        Some(("mqtt", host)) | Some(("tcp", host)) => (host, false),
        Some(("mqtts", host)) | Some(("ssl", host)) => (host, true),
        Some((scheme, _)) => return Err(anyhow!("unsupported mqtt scheme '{}'", scheme)),
        None => (server, false),
    };
    let host = host.trim_end_matches('/');
    if host.is_empty() {
        return Err(anyhow!("mqtt server must name a host"));
    }
    Ok((host.to_string(), tls))
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
