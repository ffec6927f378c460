//! Viewer event stream wire format (`text/event-stream`).
//!
//! Each processed frame becomes one `image` event:
//!
//! ```text
//! retry: 500
//! event: image
//! data: {"image":"<base64 jpeg>","threatcount":3,"inference":12.35}
//!
//! ```

use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Serialize, Serializer};

/// Reconnect hint advertised to viewers, in milliseconds.
pub const DEFAULT_RETRY_MS: u64 = 500;

/// Event name used for frame updates.
pub const IMAGE_EVENT: &str = "image";

/// Keep-alive sent to idle viewers.
pub const PING_EVENT: &[u8] = b"event: ping\n\n";

/// Threat count shown to viewers: a running total, or unknown when
/// detections carry no identities to count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreatCount {
    Known(u64),
    Unknown,
}

impl Serialize for ThreatCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ThreatCount::Known(n) => serializer.serialize_u64(*n),
            ThreatCount::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

/// One processed frame as seen by viewers.
#[derive(Clone, Debug)]
pub struct ViewerEvent {
    /// JPEG bytes of the annotated frame.
    pub annotated_image: Vec<u8>,
    pub threat_count: ThreatCount,
    pub inference_ms: Option<f64>,
}

#[derive(Serialize)]
struct ViewerPayload<'a> {
    image: &'a str,
    threatcount: ThreatCount,
    #[serde(skip_serializing_if = "Option::is_none")]
    inference: Option<f64>,
}

impl ViewerEvent {
    /// JSON body carried in the `data` field.
    pub fn payload_json(&self) -> Result<String> {
        let image = STANDARD.encode(&self.annotated_image);
        let payload = ViewerPayload {
            image: &image,
            threatcount: self.threat_count,
            inference: self.inference_ms.map(round_up_hundredths),
        };
        Ok(serde_json::to_string(&payload)?)
    }

    /// Fully framed event, ready to be written to every subscriber.
    pub fn to_wire(&self, retry_ms: u64) -> Result<Vec<u8>> {
        let data = self.payload_json()?;
        Ok(format_event(Some(IMAGE_EVENT), Some(retry_ms), &data).into_bytes())
    }
}

/// Frame one event. Multi-line data is split across several `data:` lines.
pub fn format_event(event: Option<&str>, retry_ms: Option<u64>, data: &str) -> String {
    let mut msg = String::with_capacity(data.len() + 48);
    if let Some(retry) = retry_ms {
        msg.push_str(&format!("retry: {}\n", retry));
    }
    if let Some(event) = event {
        msg.push_str(&format!("event: {}\n", event));
    }
    for line in data.split('\n') {
        msg.push_str("data: ");
        msg.push_str(line);
        msg.push('\n');
    }
    msg.push('\n');
    msg
}

fn round_up_hundredths(ms: f64) -> f64 {
    (ms * 100.0).ceil() / 100.0
}
