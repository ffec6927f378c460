use anyhow::{anyhow, Result};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{MessageBus, Qos};

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTT_CLIENT_ID: &str = "frame-sentry";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const REQUEST_QUEUE: usize = 64;
// Alerts carry two base64 JPEGs.
const MAX_PACKET_BYTES: usize = 16 * 1024 * 1024;

/// Broker connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

/// MQTT bus backed by a `rumqttc` client.
///
/// The connection event loop runs on its own thread and keeps polling through
/// errors, which is how the client reconnects. Publishing only queues the
/// request; it never waits for the broker.
pub struct MqttBus {
    client: Client,
    broker: String,
    stopping: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttBus {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_PACKET_BYTES, MAX_PACKET_BYTES);
        if let Some(user) = &settings.username {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        if settings.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, connection) = Client::new(options, REQUEST_QUEUE);
        let broker = format!("{}:{}", settings.host, settings.port);
        let stopping = Arc::new(AtomicBool::new(false));
        let handle = {
            let broker = broker.clone();
            let stopping = stopping.clone();
            std::thread::Builder::new()
                .name("mqtt-event-loop".to_string())
                .spawn(move || run_event_loop(connection, &broker, &stopping))?
        };
        log::info!(
            "mqtt: client started for {} (TLS: {}, auth: {})",
            broker,
            settings.use_tls,
            settings.username.is_some()
        );

        Ok(Self {
            client,
            broker,
            stopping,
            connection_handle: Some(handle),
        })
    }
}

fn run_event_loop(mut connection: Connection, broker: &str, stopping: &AtomicBool) {
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                log::info!("mqtt: connected to {} ({:?})", broker, ack.code);
            }
            Ok(_) => {}
            Err(err) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("mqtt: connection to {} failed: {}", broker, err);
                std::thread::sleep(RECONNECT_PAUSE);
            }
        }
    }
    log::debug!("mqtt: event loop for {} exited", broker);
}

fn to_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

impl MessageBus for MqttBus {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
        self.client
            .try_publish(topic, to_qos(qos), false, payload)
            .map_err(|e| anyhow!("mqtt publish to {} rejected: {}", self.broker, e))
    }

    fn disconnect(mut self: Box<Self>) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let result = self.client.disconnect();
        if let Some(handle) = self.connection_handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("mqtt event loop thread panicked"))?;
        }
        result.map_err(|e| anyhow!("mqtt disconnect from {} failed: {}", self.broker, e))?;
        log::info!("mqtt: disconnected from {}", self.broker);
        Ok(())
    }
}
