//! sentryd - Frame Sentry daemon
//!
//! This daemon:
//! 1. Captures frames from the configured camera, re-opening it on failure
//! 2. Runs the detector backend and filters detections
//! 3. Publishes an MQTT alert for every newly seen track id
//! 4. Streams annotated frames to browsers over `/listen`

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use frame_sentry::{
    api::{ViewerServer, ViewerServerConfig},
    build_detector,
    config::SentryConfig,
    open_source, AlertPublisher, MqttBus, Orchestrator,
};

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture, detect and stream annotated frames")]
struct Args {
    /// Path to a JSON config file.
    #[arg(long, env = "SENTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Viewer server listen address (overrides config and PORT).
    #[arg(long)]
    http_addr: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = SentryConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }

    let source = open_source(&config.capture)?;
    let detector = build_detector(&config.detector)?;
    let publisher = match config.mqtt_settings() {
        Some(settings) => {
            let bus = MqttBus::connect(&settings)
                .with_context(|| format!("connecting to mqtt broker {}", settings.host))?;
            AlertPublisher::configured(Box::new(bus), settings.topic)
        }
        None => {
            log::info!("MQTT_SERVER or MQTT_TOPIC unset; alerts disabled");
            AlertPublisher::disabled()
        }
    };

    let orchestrator = Orchestrator::new(&config.pipeline_config(), source, detector, publisher);
    let pipeline = orchestrator.start()?;
    let broadcaster = pipeline.broadcaster();

    let server_config = ViewerServerConfig {
        addr: config.http_addr.clone(),
        docroot: config.docroot.clone(),
        ..ViewerServerConfig::default()
    };
    let server = match ViewerServer::new(server_config, broadcaster.clone())
        .with_probe(pipeline.probe())
        .spawn()
    {
        Ok(server) => server,
        Err(err) => {
            pipeline.stop()?;
            return Err(err);
        }
    };
    log::info!("viewer server listening on {}", server.addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("sentryd waiting for shutdown signal (Ctrl-C)...");
    let worker_died = loop {
        match rx.recv_timeout(WATCHDOG_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break false,
            Err(RecvTimeoutError::Timeout) => {
                if !pipeline.is_running() {
                    break true;
                }
            }
        }
    };
    if worker_died {
        log::error!("pipeline worker exited unexpectedly, shutting down");
    } else {
        log::info!("shutdown signal received, stopping pipeline...");
    }

    let stopped = pipeline.stop();
    broadcaster.close();
    server.stop()?;
    stopped?;

    if worker_died {
        return Err(anyhow!("pipeline worker exited unexpectedly"));
    }
    log::info!("sentryd stopped");
    Ok(())
}
