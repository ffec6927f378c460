//! Viewer HTTP server.
//!
//! Serves the annotated stream to browsers and the liveness probes:
//! - `GET /listen`: `text/event-stream` of viewer events
//! - `GET /livez`, `/readyz`, `/healthz`: always `200 OK`
//! - `GET /status`: pipeline state and per-subscriber backlog
//! - `GET /`: redirect to `/index.html`; other paths come from the docroot
//!
//! Each connection runs on its own thread. A stream connection registers a
//! subscriber on entry and unregisters it on every exit path, so a viewer that
//! goes away stops accumulating events as soon as a write to it fails.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::broadcast::{Broadcaster, Receive};
use crate::pipeline::{PipelineStats, StatusProbe};
use crate::sse::PING_EVENT;

const MAX_REQUEST_BYTES: usize = 8192;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_SLICE: Duration = Duration::from_millis(250);

/// Keep-alive interval for idle viewer streams.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct ViewerServerConfig {
    pub addr: String,
    /// Directory of static viewer assets (index.html, scripts).
    pub docroot: Option<PathBuf>,
    pub ping_interval: Duration,
}

impl Default for ViewerServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            docroot: None,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting, end open streams and wait for every connection thread.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("viewer server thread panicked"))?;
        }
        Ok(())
    }
}

struct Context {
    broadcaster: Arc<Broadcaster>,
    probe: Option<StatusProbe>,
    docroot: Option<PathBuf>,
    ping_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

pub struct ViewerServer {
    cfg: ViewerServerConfig,
    broadcaster: Arc<Broadcaster>,
    probe: Option<StatusProbe>,
}

impl ViewerServer {
    pub fn new(cfg: ViewerServerConfig, broadcaster: Arc<Broadcaster>) -> Self {
        Self {
            cfg,
            broadcaster,
            probe: None,
        }
    }

    /// Report pipeline state on `/status`.
    pub fn with_probe(mut self, probe: StatusProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .map_err(|e| anyhow!("invalid viewer server address '{}': {}", self.cfg.addr, e))?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(Context {
            broadcaster: self.broadcaster,
            probe: self.probe,
            docroot: self.cfg.docroot,
            ping_interval: self.cfg.ping_interval,
            shutdown: shutdown.clone(),
        });
        let join = std::thread::Builder::new()
            .name("viewer-server".to_string())
            .spawn(move || {
                if let Err(err) = run_server(listener, ctx) {
                    log::error!("viewer server stopped: {}", err);
                }
            })?;

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_server(listener: TcpListener, ctx: Arc<Context>) -> Result<()> {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    let result = loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        connections.retain(|c| !c.is_finished());
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("viewer-{}", peer))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, peer, &ctx) {
                            log::debug!("viewer connection {} ended: {:#}", peer, err);
                        }
                    });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(err) => log::warn!("viewer server could not spawn handler: {}", err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => break Err(err.into()),
        }
    };
    for handle in connections {
        let _ = handle.join();
    }
    result
}

fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: &Context) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_response(&mut stream, 405, "text/plain", b"method not allowed", &[])?;
        return Ok(());
    }
    match request.path.as_str() {
        "/livez" | "/readyz" | "/healthz" => {
            write_response(&mut stream, 200, "text/plain", b"OK", &[])?;
            return Ok(());
        }
        _ => log::debug!("viewer request {} {} from {}", request.method, request.path, peer),
    }
    match request.path.as_str() {
        "/" => write_response(&mut stream, 302, "text/plain", b"", &[("Location", "/index.html")]),
        "/listen" => stream_events(stream, peer, ctx),
        "/status" => {
            let body = serde_json::to_vec(&status_report(ctx))?;
            write_response(&mut stream, 200, "application/json", &body, &[])
        }
        path => serve_static(&mut stream, ctx.docroot.as_deref(), path),
    }
}

fn stream_events(mut stream: TcpStream, peer: SocketAddr, ctx: &Context) -> Result<()> {
    let subscription = match ctx.broadcaster.register() {
        Ok(subscription) => subscription,
        Err(err) => {
            write_response(&mut stream, 503, "text/plain", b"shutting down", &[])?;
            return Err(err);
        }
    };
    log::info!("viewer {} subscribed as {}", peer, subscription.id());

    let pumped = write_stream_head(&mut stream).and_then(|()| {
        let mut last_write = Instant::now();
        loop {
            if ctx.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            match subscription.receive_timeout(POLL_SLICE) {
                Receive::Event(event) => {
                    stream.write_all(&event)?;
                    stream.flush()?;
                    last_write = Instant::now();
                }
                Receive::Idle => {
                    if last_write.elapsed() >= ctx.ping_interval {
                        stream.write_all(PING_EVENT)?;
                        stream.flush()?;
                        last_write = Instant::now();
                    }
                }
                Receive::Closed => return Ok(()),
            }
        }
    });

    ctx.broadcaster.unregister(subscription.id());
    match &pumped {
        Ok(()) => log::info!("viewer {} stream closed", peer),
        Err(err) => log::info!("viewer {} disconnected: {}", peer, err),
    }
    pumped
}

fn write_stream_head(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(
        b"HTTP/1.1 200 OK\r\n\
          Content-Type: text/event-stream\r\n\
          Cache-Control: no-cache\r\n\
          Connection: keep-alive\r\n\
          Access-Control-Allow-Origin: *\r\n\r\n",
    )?;
    stream.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    state: &'static str,
    subscribers: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<PipelineStats>,
}

fn status_report(ctx: &Context) -> StatusReport {
    let subscribers = ctx
        .broadcaster
        .inbox_depths()
        .into_iter()
        .map(|(id, depth)| (id.to_string(), depth))
        .collect();
    StatusReport {
        state: ctx
            .probe
            .as_ref()
            .map_or("unknown", |probe| probe.state().as_str()),
        subscribers,
        stats: ctx.probe.as_ref().map(|probe| probe.stats()),
    }
}

fn serve_static(stream: &mut TcpStream, docroot: Option<&Path>, path: &str) -> Result<()> {
    let Some(file) = docroot.and_then(|root| resolve_static(root, path)) else {
        return write_response(stream, 404, "text/plain", b"not found", &[]);
    };
    match std::fs::read(&file) {
        Ok(body) => write_response(stream, 200, content_type_for(&file), &body, &[]),
        Err(_) => write_response(stream, 404, "text/plain", b"not found", &[]),
    }
}

/// Map a request path onto a file under `root`, refusing anything that
/// would escape it.
fn resolve_static(root: &Path, path: &str) -> Option<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        return None;
    }
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(relative))
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text.split("\r\n").next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
    extra_headers: &[(&str, &str)],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        302 => "HTTP/1.1 302 Found",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let mut header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    for (name, value) in extra_headers {
        header.push_str(&format!("{}: {}\r\n", name, value));
    }
    header.push_str("\r\n");
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
