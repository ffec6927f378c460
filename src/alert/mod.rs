//! Alert publishing.
//!
//! A frame judged novel becomes one `AlertEvent` (annotated + raw JPEG,
//! unix timestamp) published at-least-once on the configured topic. Whether a
//! bus exists at all is decided once, when the `AlertPublisher` is built.
//! Delivery retries and reconnects belong to the bus client, not to this module.

mod mqtt;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::RgbImage;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::frame::encode_jpeg;

pub use mqtt::{MqttBus, MqttSettings, DEFAULT_MQTT_CLIENT_ID, DEFAULT_MQTT_PORT};

/// Delivery guarantee requested from the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Publish capability of a pub/sub client.
pub trait MessageBus: Send {
    /// Hand a message to the client. Must not wait for broker acknowledgement.
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()>;

    /// Flush and close the connection.
    fn disconnect(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Message published for each novel frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlertEvent {
    pub annotated_image: Vec<u8>,
    pub raw_image: Vec<u8>,
    pub timestamp: u64,
}

#[derive(Serialize)]
struct AlertPayload {
    annotated_image: String,
    raw_image: String,
    timestamp: u64,
}

impl AlertEvent {
    pub fn new(annotated_image: Vec<u8>, raw_image: Vec<u8>) -> Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before unix epoch")?
            .as_secs();
        Ok(Self {
            annotated_image,
            raw_image,
            timestamp,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        let payload = AlertPayload {
            annotated_image: STANDARD.encode(&self.annotated_image),
            raw_image: STANDARD.encode(&self.raw_image),
            timestamp: self.timestamp,
        };
        Ok(serde_json::to_vec(&payload)?)
    }
}

/// Alert publish decision: configured with a bus and topic, or disabled.
pub enum AlertPublisher {
    Configured {
        bus: Box<dyn MessageBus>,
        topic: String,
    },
    Disabled,
}

impl AlertPublisher {
    pub fn configured(bus: Box<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self::Configured {
            bus,
            topic: topic.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::Disabled
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Configured { .. })
    }

    /// Publish an alert when `novel` is set. Returns true when a message was
    /// handed to the bus. Failures are logged and swallowed.
    pub fn publish_if_novel(&self, novel: bool, raw: &RgbImage, annotated_jpeg: &[u8]) -> bool {
        let Self::Configured { bus, topic } = self else {
            return false;
        };
        if !novel {
            return false;
        }
        match build_alert(raw, annotated_jpeg).and_then(|alert| alert.to_json()) {
            Ok(payload) => match bus.publish(topic, payload, Qos::AtLeastOnce) {
                Ok(()) => {
                    log::info!("alert: published to {}", topic);
                    true
                }
                Err(err) => {
                    log::warn!("alert: publish to {} failed: {:#}", topic, err);
                    false
                }
            },
            Err(err) => {
                log::warn!("alert: could not build alert payload: {:#}", err);
                false
            }
        }
    }

    /// Disconnect the bus, if any.
    pub fn shutdown(self) -> Result<()> {
        match self {
            Self::Configured { bus, topic } => {
                log::info!("alert: disconnecting bus for {}", topic);
                bus.disconnect()
            }
            Self::Disabled => Ok(()),
        }
    }
}

fn build_alert(raw: &RgbImage, annotated_jpeg: &[u8]) -> Result<AlertEvent> {
    let raw_jpeg = encode_jpeg(raw)?;
    AlertEvent::new(annotated_jpeg.to_vec(), raw_jpeg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::Value;
    use std::sync::{Arc, Mutex};

    type Published = Arc<Mutex<Vec<(String, Vec<u8>, Qos)>>>;

    struct RecordingBus {
        published: Published,
        fail: bool,
    }

    impl MessageBus for RecordingBus {
        fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
            if self.fail {
                return Err(anyhow!("broker unreachable"));
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload, qos));
            Ok(())
        }
    }

    fn publisher(fail: bool) -> (AlertPublisher, Published) {
        let published = Published::default();
        let bus = RecordingBus {
            published: published.clone(),
            fail,
        };
        (AlertPublisher::configured(Box::new(bus), "alerts/cam1"), published)
    }

    fn raw() -> RgbImage {
        RgbImage::from_pixel(8, 8, image::Rgb([10, 20, 30]))
    }

    #[test]
    fn publishes_only_novel_frames() -> Result<()> {
        let (publisher, published) = publisher(false);
        assert!(!publisher.publish_if_novel(false, &raw(), b"jpeg"));
        assert!(publisher.publish_if_novel(true, &raw(), b"jpeg"));

        let published = published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let (topic, payload, qos) = &published[0];
        assert_eq!(topic, "alerts/cam1");
        assert_eq!(*qos, Qos::AtLeastOnce);

        let json: Value = serde_json::from_slice(payload)?;
        assert_eq!(json["annotated_image"], STANDARD.encode(b"jpeg"));
        let raw_jpeg = STANDARD.decode(json["raw_image"].as_str().unwrap())?;
        assert_eq!(&raw_jpeg[..2], &[0xFF, 0xD8]);
        assert!(json["timestamp"].as_u64().unwrap() > 1_600_000_000);
        Ok(())
    }

    #[test]
    fn publish_failure_is_not_fatal() {
        let (publisher, _) = publisher(true);
        assert!(!publisher.publish_if_novel(true, &raw(), b"jpeg"));
    }

    #[test]
    fn disabled_publisher_is_a_no_op() -> Result<()> {
        let publisher = AlertPublisher::disabled();
        assert!(!publisher.is_enabled());
        assert!(!publisher.publish_if_novel(true, &raw(), b"jpeg"));
        publisher.shutdown()
    }
}
