/// mpv IPC driver with separated reader/writer tasks, and the `AudioEngine`
/// built on top of it.
///
/// Architecture:
///
/// ```text
///   MpvEngine::ensure_handle()
///         │
///         ├── MpvDriver::spawn_and_connect()
///         │       ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         │       └── reader_task   ← reads JSON lines from socket
///         │                              ├── response (has request_id) → matched oneshot::Sender
///         │                              └── event / property-change   → MpvEvent channel
///         │
///         └── forwarder task  ← MpvEventTranslator turns MpvEvent into
///                               EngineEvent, sent to PlayerCore as PlayerEvent::Engine
/// ```
///
/// Unix domain sockets only.  On other platforms spawning reports an error,
/// which the core handles like any other engine failure.
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::core::PlayerEvent;
use crate::engine::{AudioEngine, EngineEvent};

#[cfg(unix)]
use tokio::net::UnixStream;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_PAUSED_FOR_CACHE: u64 = 3;

// ── internal channel types ────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load_stream(&self, url: &str, volume: f32) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url])).await?;
        let vol_pct = (volume * 100.0).clamp(0.0, 100.0);
        if let Err(e) = self.send(json!(["set_property", "volume", vol_pct])).await {
            warn!("mpv: failed to set volume {}: {}", vol_pct, e);
        }
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    async fn get_bool(&self, property: &str) -> anyhow::Result<bool> {
        let resp = self.send(json!(["get_property", property])).await?;
        resp["data"]
            .as_bool()
            .ok_or_else(|| anyhow::anyhow!("mpv property {} is not a bool", property))
    }

    /// Register observe_property for everything the translator looks at.
    /// Must be called after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSE, "pause"),
            (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
}

impl MpvDriver {
    pub fn new(volume: f32) -> Self {
        Self {
            socket_name: paradise_proto::platform::mpv_socket_name(),
            process: None,
            last_volume: volume,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        info!("mpv: spawning new process");
        let mpv_binary = paradise_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let vol_arg = format!(
            "--volume={}",
            (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let ipc_arg = paradise_proto::platform::mpv_socket_arg();

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(&ipc_arg)
            .arg("--quiet")
            .arg("--cache=yes")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        Ok(Self::start_io_tasks(stream, event_tx))
    }

    #[cfg(not(unix))]
    pub async fn spawn_and_connect(
        &mut self,
        _event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        anyhow::bail!("mpv IPC is only supported on unix")
    }

    #[cfg(unix)]
    fn start_io_tasks(stream: UnixStream, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle {
        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::new(read_half);

        // req_id → reply channel.  Writer inserts, reader resolves.
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

        tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
        tokio::spawn(reader_task(reader, pending, event_tx));

        MpvHandle { tx: cmd_tx }
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
                // Lets the translator report the engine as gone.
                let _ = event_tx
                    .send(MpvEvent {
                        raw: json!({ "event": "end-file", "reason": "quit" }),
                    })
                    .await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, &format!("mpv IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── event translation ─────────────────────────────────────────────────────────

/// Turns raw mpv events into engine state changes.  Consecutive duplicates
/// are collapsed, since mpv re-sends property values on every observe.
#[derive(Debug, Default)]
pub struct MpvEventTranslator {
    loaded: bool,
    paused: bool,
    core_idle: Option<bool>,
    last: Option<EngineEvent>,
}

impl MpvEventTranslator {
    pub fn translate(&mut self, evt: &MpvEvent) -> Option<EngineEvent> {
        let next = self.derive(evt)?;
        if self.last.as_ref() == Some(&next) {
            return None;
        }
        self.last = Some(next.clone());
        Some(next)
    }

    fn derive(&mut self, evt: &MpvEvent) -> Option<EngineEvent> {
        if let Some((obs_id, data)) = evt.as_property_change() {
            return match obs_id {
                OBS_PAUSE => {
                    self.paused = data.as_bool().unwrap_or(false);
                    if self.paused {
                        Some(EngineEvent::Paused)
                    } else {
                        self.flowing()
                    }
                }
                OBS_CORE_IDLE => {
                    self.core_idle = data.as_bool();
                    self.flowing()
                }
                OBS_PAUSED_FOR_CACHE => {
                    if data.as_bool() == Some(true) && self.loaded && !self.paused {
                        Some(EngineEvent::Buffering)
                    } else {
                        self.flowing()
                    }
                }
                _ => None,
            };
        }

        match evt.event_name()? {
            "start-file" => {
                self.loaded = false;
                None
            }
            "file-loaded" => {
                self.loaded = true;
                Some(EngineEvent::Ready)
            }
            "end-file" => {
                self.loaded = false;
                let reason = evt
                    .raw
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                match reason {
                    "stop" | "eof" => Some(EngineEvent::Stopped),
                    "error" | "network" | "quit" => {
                        let detail = evt
                            .raw
                            .get("file_error")
                            .and_then(|v| v.as_str())
                            .unwrap_or(reason);
                        Some(EngineEvent::Error(detail.to_string()))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Playing once audio flows, Buffering while a loaded stream idles.
    fn flowing(&self) -> Option<EngineEvent> {
        if !self.loaded || self.paused {
            return None;
        }
        match self.core_idle {
            Some(false) => Some(EngineEvent::Playing),
            Some(true) => Some(EngineEvent::Buffering),
            None => None,
        }
    }
}

// ── AudioEngine ───────────────────────────────────────────────────────────────

struct MpvInner {
    driver: MpvDriver,
    /// Live handle to the mpv IO tasks.  `None` when mpv is not connected.
    handle: Option<MpvHandle>,
    forwarder: Option<AbortHandle>,
}

pub struct MpvEngine {
    inner: Mutex<MpvInner>,
    core_tx: mpsc::Sender<PlayerEvent>,
}

impl MpvEngine {
    pub fn new(volume: f32, core_tx: mpsc::Sender<PlayerEvent>) -> Self {
        Self {
            inner: Mutex::new(MpvInner {
                driver: MpvDriver::new(volume),
                handle: None,
                forwarder: None,
            }),
            core_tx,
        }
    }

    async fn ensure_handle(&self, inner: &mut MpvInner) -> anyhow::Result<MpvHandle> {
        if inner.handle.is_some() && !inner.driver.process_alive() {
            warn!("mpv: process died, dropping handle");
            inner.handle = None;
        }
        if let Some(handle) = &inner.handle {
            return Ok(handle.clone());
        }

        if let Some(prev) = inner.forwarder.take() {
            prev.abort();
        }
        let (event_tx, mut event_rx) = mpsc::channel::<MpvEvent>(64);
        let core_tx = self.core_tx.clone();
        let forwarder = tokio::spawn(async move {
            let mut translator = MpvEventTranslator::default();
            while let Some(evt) = event_rx.recv().await {
                if let Some(engine_evt) = translator.translate(&evt) {
                    debug!("mpv: {:?}", engine_evt);
                    if core_tx.send(PlayerEvent::Engine(engine_evt)).await.is_err() {
                        break;
                    }
                }
            }
        });
        inner.forwarder = Some(forwarder.abort_handle());

        let handle = inner.driver.spawn_and_connect(event_tx).await?;
        handle.observe_all_properties().await;
        inner.handle = Some(handle.clone());
        Ok(handle)
    }
}

#[async_trait]
impl AudioEngine for MpvEngine {
    async fn play(&self, url: &str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        let handle = self.ensure_handle(&mut inner).await?;
        let volume = inner.driver.last_volume;
        handle.load_stream(url, volume).await?;
        handle.set_pause(false).await
    }

    async fn pause(&self) -> anyhow::Result<()> {
        let inner = self.inner.lock().await;
        match &inner.handle {
            Some(handle) => handle.set_pause(true).await,
            None => Ok(()),
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let inner = self.inner.lock().await;
        match &inner.handle {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    async fn reinitialize(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        info!("mpv: reinitialising");
        inner.handle = None;
        if let Some(forwarder) = inner.forwarder.take() {
            forwarder.abort();
        }
        inner.driver.kill().await;
        Ok(())
    }

    async fn is_playing(&self) -> bool {
        let inner = self.inner.lock().await;
        let Some(handle) = &inner.handle else {
            return false;
        };
        let paused = handle.get_bool("pause").await.unwrap_or(true);
        let idle = handle.get_bool("core-idle").await.unwrap_or(true);
        !paused && !idle
    }
}
