//! Client for the broadcast engine's control protocol.
//!
//! The engine exposes a persistent TCP control socket speaking
//! newline-delimited JSON (see [`protocol`]). [`Channel`] maintains exactly
//! one live connection, reconnects with jittered exponential backoff when it
//! drops, and re-establishes event subscriptions transparently. Callers that
//! need to swap the transport out (tests, dry runs) talk to [`EngineApi`]
//! instead of the concrete channel.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub mod backoff;
pub mod protocol;

pub use backoff::Backoff;
pub use protocol::{
    ActiveScene, CallFrame, EngineStats, Event, EventKind, Inbound, ReplyFrame, Request,
    SceneList, SourceActive, StreamStatus, VideoSettings,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// No live connection; the call was never sent.
    NotConnected,
    /// The connection dropped while the call was in flight.
    Disconnected,
    /// No reply within the per-call deadline.
    Timeout,
    /// The engine answered with an error.
    Engine(String),
    /// The peer sent something we could not make sense of.
    Protocol(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::NotConnected => write!(f, "control channel not connected"),
            ChannelError::Disconnected => write!(f, "control channel disconnected mid-call"),
            ChannelError::Timeout => write!(f, "control call timed out"),
            ChannelError::Engine(msg) => write!(f, "engine error: {}", msg),
            ChannelError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Protocol(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connected,
    Reconnecting { attempt: u32 },
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub addr: String,
    pub token: Option<String>,
    pub call_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:4455".to_string(),
            token: None,
            call_timeout: Duration::from_secs(5),
            backoff: Backoff::default(),
        }
    }
}

/// Engine operations the supervisor consumes.
#[async_trait]
pub trait EngineApi: Send + Sync {
    async fn list_scenes(&self) -> Result<Vec<String>, ChannelError>;
    async fn create_scene(&self, scene: &str) -> Result<(), ChannelError>;
    async fn active_scene(&self) -> Result<String, ChannelError>;
    async fn set_active_scene(&self, scene: &str) -> Result<(), ChannelError>;
    async fn set_source_enabled(&self, source: &str, enabled: bool) -> Result<(), ChannelError>;
    async fn source_settings(&self, source: &str) -> Result<Value, ChannelError>;
    async fn set_source_settings(&self, source: &str, settings: Value) -> Result<(), ChannelError>;
    async fn source_active(&self, source: &str) -> Result<SourceActive, ChannelError>;
    async fn start_stream(&self) -> Result<(), ChannelError>;
    async fn stop_stream(&self) -> Result<(), ChannelError>;
    async fn stream_status(&self) -> Result<StreamStatus, ChannelError>;
    async fn stats(&self) -> Result<EngineStats, ChannelError>;
    async fn video_settings(&self) -> Result<VideoSettings, ChannelError>;
    async fn subscribe(&self, kind: EventKind) -> Result<broadcast::Receiver<Event>, ChannelError>;
    fn link_state(&self) -> watch::Receiver<LinkState>;
}

type PendingReply = oneshot::Sender<Result<Option<Value>, ChannelError>>;

struct Inner {
    cfg: ChannelConfig,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingReply>>,
    conn_tx: Mutex<Option<mpsc::Sender<String>>>,
    events: broadcast::Sender<Event>,
    state_tx: watch::Sender<LinkState>,
    state_rx: watch::Receiver<LinkState>,
    subs: Mutex<HashSet<EventKind>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Persistent control connection with automatic reconnect.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Spawn the connection task and return immediately. Use
    /// [`Channel::wait_connected`] to block until the link is up.
    pub fn open(cfg: ChannelConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);
        let (shutdown_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        let backoff = cfg.backoff.clone();
        let inner = Arc::new(Inner {
            cfg,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            conn_tx: Mutex::new(None),
            events,
            state_tx,
            state_rx,
            subs: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            shutdown_tx,
        });
        tokio::spawn(run(inner.clone(), backoff));
        Self { inner }
    }

    /// Wait until the link reports connected, up to `deadline`.
    pub async fn wait_connected(&self, deadline: Duration) -> Result<(), ChannelError> {
        let mut state = self.inner.state_rx.clone();
        let wait = async {
            loop {
                if state.borrow().is_connected() {
                    return;
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(deadline, wait)
            .await
            .map_err(|_| ChannelError::NotConnected)?;
        if self.inner.state_rx.borrow().is_connected() {
            Ok(())
        } else {
            Err(ChannelError::NotConnected)
        }
    }

    /// Stop reconnecting and drop the live connection.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);
        *self.inner.conn_tx.lock().unwrap() = None;
    }

    async fn call(&self, request: Request) -> Result<Option<Value>, ChannelError> {
        call_raw(&self.inner, request).await
    }

    async fn call_unit(&self, request: Request) -> Result<(), ChannelError> {
        self.call(request).await.map(|_| ())
    }

    async fn call_typed<T: DeserializeOwned>(&self, request: Request) -> Result<T, ChannelError> {
        let data = self.call(request).await?;
        decode(data)
    }
}

fn decode<T: DeserializeOwned>(data: Option<Value>) -> Result<T, ChannelError> {
    serde_json::from_value(data.unwrap_or(Value::Null))
        .map_err(|err| ChannelError::Protocol(err.to_string()))
}

async fn call_raw(inner: &Arc<Inner>, request: Request) -> Result<Option<Value>, ChannelError> {
    let conn = inner
        .conn_tx
        .lock()
        .unwrap()
        .clone()
        .ok_or(ChannelError::NotConnected)?;

    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let line = serde_json::to_string(&CallFrame { id, request })?;

    let (reply_tx, reply_rx) = oneshot::channel();
    inner.pending.lock().unwrap().insert(id, reply_tx);

    if conn.send(line).await.is_err() {
        inner.pending.lock().unwrap().remove(&id);
        return Err(ChannelError::NotConnected);
    }

    match tokio::time::timeout(inner.cfg.call_timeout, reply_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ChannelError::Disconnected),
        Err(_) => {
            inner.pending.lock().unwrap().remove(&id);
            Err(ChannelError::Timeout)
        }
    }
}

async fn run(inner: Arc<Inner>, mut backoff: Backoff) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        match TcpStream::connect(&inner.cfg.addr).await {
            Ok(stream) => {
                info!(addr = %inner.cfg.addr, "control channel connected");
                backoff.reset();
                let _ = inner.state_tx.send(LinkState::Connected);
                resubscribe(&inner);
                serve_connection(&inner, stream, &mut shutdown).await;
                fail_pending(&inner);
                *inner.conn_tx.lock().unwrap() = None;
            }
            Err(err) => {
                debug!(addr = %inner.cfg.addr, %err, "control connect failed");
            }
        }
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        let delay = backoff.next_delay();
        let _ = inner.state_tx.send(LinkState::Reconnecting {
            attempt: backoff.attempts(),
        });
        warn!(
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            "control channel down, reconnecting"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    let _ = inner.state_tx.send(LinkState::Idle);
    fail_pending(&inner);
}

/// Replay identify + event subscriptions after a (re)connect.
fn resubscribe(inner: &Arc<Inner>) {
    let kinds: Vec<EventKind> = inner.subs.lock().unwrap().iter().copied().collect();
    let token = inner.cfg.token.clone();
    let inner = inner.clone();
    tokio::spawn(async move {
        if let Some(token) = token {
            if let Err(err) = call_raw(&inner, Request::Identify { token }).await {
                warn!(%err, "engine identify failed");
            }
        }
        for kind in kinds {
            if let Err(err) = call_raw(&inner, Request::Subscribe { kind }).await {
                warn!(?kind, %err, "event resubscribe failed");
            }
        }
    });
}

async fn serve_connection(
    inner: &Arc<Inner>,
    stream: TcpStream,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<String>(64);
    *inner.conn_tx.lock().unwrap() = Some(tx);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => dispatch(inner, &line),
                Ok(None) => break,
                Err(err) => {
                    debug!(%err, "control read failed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    writer.abort();
}

fn dispatch(inner: &Arc<Inner>, line: &str) {
    match serde_json::from_str::<Inbound>(line) {
        Ok(Inbound::Reply(reply)) => {
            if let Some(tx) = inner.pending.lock().unwrap().remove(&reply.id) {
                let result = if reply.ok {
                    Ok(reply.data)
                } else {
                    Err(ChannelError::Engine(reply.error.unwrap_or_default()))
                };
                let _ = tx.send(result);
            }
        }
        Ok(Inbound::Event(event)) => {
            let _ = inner.events.send(event);
        }
        Err(err) => {
            warn!(%err, line, "unparseable control frame");
        }
    }
}

fn fail_pending(inner: &Arc<Inner>) {
    let pending: Vec<PendingReply> = {
        let mut map = inner.pending.lock().unwrap();
        map.drain().map(|(_, tx)| tx).collect()
    };
    for tx in pending {
        let _ = tx.send(Err(ChannelError::Disconnected));
    }
}

#[async_trait]
impl EngineApi for Channel {
    async fn list_scenes(&self) -> Result<Vec<String>, ChannelError> {
        let list: SceneList = self.call_typed(Request::ListScenes).await?;
        Ok(list.scenes)
    }

    async fn create_scene(&self, scene: &str) -> Result<(), ChannelError> {
        self.call_unit(Request::CreateScene {
            scene: scene.to_string(),
        })
        .await
    }

    async fn active_scene(&self) -> Result<String, ChannelError> {
        let active: ActiveScene = self.call_typed(Request::GetActiveScene).await?;
        Ok(active.scene)
    }

    async fn set_active_scene(&self, scene: &str) -> Result<(), ChannelError> {
        self.call_unit(Request::SetActiveScene {
            scene: scene.to_string(),
        })
        .await
    }

    async fn set_source_enabled(&self, source: &str, enabled: bool) -> Result<(), ChannelError> {
        self.call_unit(Request::SetSourceEnabled {
            source: source.to_string(),
            enabled,
        })
        .await
    }

    async fn source_settings(&self, source: &str) -> Result<Value, ChannelError> {
        let data = self
            .call(Request::GetSourceSettings {
                source: source.to_string(),
            })
            .await?;
        Ok(data.unwrap_or(Value::Null))
    }

    async fn set_source_settings(&self, source: &str, settings: Value) -> Result<(), ChannelError> {
        self.call_unit(Request::SetSourceSettings {
            source: source.to_string(),
            settings,
        })
        .await
    }

    async fn source_active(&self, source: &str) -> Result<SourceActive, ChannelError> {
        self.call_typed(Request::GetSourceActive {
            source: source.to_string(),
        })
        .await
    }

    async fn start_stream(&self) -> Result<(), ChannelError> {
        self.call_unit(Request::StartStream).await
    }

    async fn stop_stream(&self) -> Result<(), ChannelError> {
        self.call_unit(Request::StopStream).await
    }

    async fn stream_status(&self) -> Result<StreamStatus, ChannelError> {
        self.call_typed(Request::GetStreamStatus).await
    }

    async fn stats(&self) -> Result<EngineStats, ChannelError> {
        self.call_typed(Request::GetStats).await
    }

    async fn video_settings(&self) -> Result<VideoSettings, ChannelError> {
        self.call_typed(Request::GetVideoSettings).await
    }

    async fn subscribe(&self, kind: EventKind) -> Result<broadcast::Receiver<Event>, ChannelError> {
        let first = self.inner.subs.lock().unwrap().insert(kind);
        if first && self.inner.state_rx.borrow().is_connected() {
            self.call_unit(Request::Subscribe { kind }).await?;
        }
        Ok(self.inner.events.subscribe())
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state_rx.clone()
    }
}
