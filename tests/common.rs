//! Shared test harness: an in-process mock engine behind `EngineApi`, a
//! scripted process-lifecycle hook, and a runner that brings the whole
//! supervisor up with millisecond-scale intervals.

// Not every test crate uses every knob.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot, watch};

use engine::{
    ChannelError, EngineApi, EngineStats, Event, EventKind, LinkState, SourceActive, StreamStatus,
    VideoSettings,
};
use liveward::config::Config;
use liveward::content::{ContentProvider, FallbackProvider, ProcessLifecycle};
use liveward::event::SupervisorEvent;
use liveward::fault::Fault;
use liveward::store::Store;

#[derive(Debug, Default, Clone)]
pub struct SourceState {
    pub active: bool,
    pub live: bool,
    pub enabled: Option<bool>,
    pub settings: Option<Value>,
}

struct EngineState {
    scenes: Vec<String>,
    active_scene: String,
    streaming: bool,
    reconnecting: bool,
    responsive: bool,
    start_failures_left: u32,
    start_count: u32,
    sources: HashMap<String, SourceState>,
    stats: EngineStats,
    bytes_sent: u64,
    duration_ms: u64,
}

pub struct MockEngine {
    state: Mutex<EngineState>,
    events: broadcast::Sender<Event>,
    link_tx: watch::Sender<LinkState>,
    link_rx: watch::Receiver<LinkState>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        let (link_tx, link_rx) = watch::channel(LinkState::Connected);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(EngineState {
                scenes: Vec::new(),
                active_scene: "Automated Content".to_string(),
                streaming: false,
                reconnecting: false,
                responsive: true,
                start_failures_left: 0,
                start_count: 0,
                sources: HashMap::new(),
                stats: EngineStats {
                    cpu_pct: 35.0,
                    fps: 30.0,
                    skipped_frames: 0,
                    total_frames: 10_000,
                },
                bytes_sent: 0,
                duration_ms: 0,
            }),
            events,
            link_tx,
            link_rx,
        })
    }

    pub fn set_streaming(&self, active: bool, reconnecting: bool) {
        let mut state = self.state.lock().unwrap();
        state.streaming = active;
        state.reconnecting = reconnecting;
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.state.lock().unwrap().responsive = responsive;
        let _ = self.link_tx.send(if responsive {
            LinkState::Connected
        } else {
            LinkState::Reconnecting { attempt: 1 }
        });
    }

    pub fn set_source(&self, name: &str, active: bool, live: bool) {
        let mut state = self.state.lock().unwrap();
        let entry = state.sources.entry(name.to_string()).or_default();
        entry.active = active;
        entry.live = live;
    }

    pub fn set_dropped_frames(&self, skipped: u64, total: u64) {
        let mut state = self.state.lock().unwrap();
        state.stats.skipped_frames = skipped;
        state.stats.total_frames = total;
    }

    pub fn fail_next_starts(&self, count: u32) {
        self.state.lock().unwrap().start_failures_left = count;
    }

    pub fn active_scene_name(&self) -> String {
        self.state.lock().unwrap().active_scene.clone()
    }

    pub fn scene_names(&self) -> Vec<String> {
        self.state.lock().unwrap().scenes.clone()
    }

    pub fn start_count(&self) -> u32 {
        self.state.lock().unwrap().start_count
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().unwrap().streaming
    }

    pub fn source_state(&self, name: &str) -> SourceState {
        self.state
            .lock()
            .unwrap()
            .sources
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), ChannelError> {
        if self.state.lock().unwrap().responsive {
            Ok(())
        } else {
            Err(ChannelError::Timeout)
        }
    }
}

#[async_trait]
impl EngineApi for MockEngine {
    async fn list_scenes(&self) -> Result<Vec<String>, ChannelError> {
        self.check()?;
        Ok(self.scene_names())
    }

    async fn create_scene(&self, scene: &str) -> Result<(), ChannelError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if !state.scenes.iter().any(|existing| existing == scene) {
            state.scenes.push(scene.to_string());
        }
        Ok(())
    }

    async fn active_scene(&self) -> Result<String, ChannelError> {
        self.check()?;
        Ok(self.active_scene_name())
    }

    async fn set_active_scene(&self, scene: &str) -> Result<(), ChannelError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if !state.scenes.iter().any(|existing| existing == scene) {
            return Err(ChannelError::Engine(format!("no such scene: {}", scene)));
        }
        state.active_scene = scene.to_string();
        Ok(())
    }

    async fn set_source_enabled(&self, source: &str, enabled: bool) -> Result<(), ChannelError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.sources.entry(source.to_string()).or_default().enabled = Some(enabled);
        Ok(())
    }

    async fn source_settings(&self, source: &str) -> Result<Value, ChannelError> {
        self.check()?;
        Ok(self
            .source_state(source)
            .settings
            .unwrap_or(Value::Null))
    }

    async fn set_source_settings(&self, source: &str, settings: Value) -> Result<(), ChannelError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state
            .sources
            .entry(source.to_string())
            .or_default()
            .settings = Some(settings);
        Ok(())
    }

    async fn source_active(&self, source: &str) -> Result<SourceActive, ChannelError> {
        self.check()?;
        let state = self.source_state(source);
        Ok(SourceActive {
            active: state.active,
            live: state.live,
        })
    }

    async fn start_stream(&self) -> Result<(), ChannelError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if state.start_failures_left > 0 {
            state.start_failures_left -= 1;
            return Err(ChannelError::Engine("destination refused".to_string()));
        }
        state.streaming = true;
        state.reconnecting = false;
        state.start_count += 1;
        Ok(())
    }

    async fn stop_stream(&self) -> Result<(), ChannelError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.streaming = false;
        state.reconnecting = false;
        Ok(())
    }

    async fn stream_status(&self) -> Result<StreamStatus, ChannelError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if state.streaming {
            state.duration_ms += 100;
            state.bytes_sent += 75_000;
        }
        Ok(StreamStatus {
            active: state.streaming,
            reconnecting: state.reconnecting,
            bytes_sent: state.bytes_sent,
            duration_ms: state.duration_ms,
        })
    }

    async fn stats(&self) -> Result<EngineStats, ChannelError> {
        self.check()?;
        Ok(self.state.lock().unwrap().stats)
    }

    async fn video_settings(&self) -> Result<VideoSettings, ChannelError> {
        self.check()?;
        Ok(VideoSettings {
            base_width: 1920,
            base_height: 1080,
            fps: 30.0,
        })
    }

    async fn subscribe(&self, _kind: EventKind) -> Result<broadcast::Receiver<Event>, ChannelError> {
        self.check()?;
        Ok(self.events.subscribe())
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link_rx.clone()
    }
}

pub struct MockLifecycle {
    engine: Arc<MockEngine>,
    succeed: bool,
    pub restarts: AtomicU32,
}

impl MockLifecycle {
    pub fn new(engine: Arc<MockEngine>, succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            engine,
            succeed,
            restarts: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ProcessLifecycle for MockLifecycle {
    async fn restart(&self, _target: &str) -> anyhow::Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            self.engine.set_responsive(true);
            Ok(())
        } else {
            Err(anyhow::anyhow!("restart rejected"))
        }
    }
}

pub struct Harness {
    pub cfg: Config,
    pub store: Store,
    pub engine: Arc<MockEngine>,
    pub lifecycle: Arc<MockLifecycle>,
    pub events: broadcast::Sender<SupervisorEvent>,
    pub http_addr: std::net::SocketAddr,
    pub content_dir: tempfile::TempDir,
    stop_tx: Option<oneshot::Sender<()>>,
    _probe_listener: TcpListener,
}

impl Harness {
    pub fn raise(&self, fault: Fault) {
        let _ = self.events.send(SupervisorEvent::PossibleFailure(fault));
    }

    pub fn fallback_path(&self) -> PathBuf {
        self.cfg.content.fallback_file.clone()
    }

    /// Ask the server to unwind and give it a moment to flush.
    pub async fn stop(mut self) -> Store {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.store.clone()
    }
}

/// Millisecond-scale intervals so scenario budgets hold under `cargo test`.
fn fast_config(fallback_file: PathBuf, probe_addr: std::net::SocketAddr) -> Config {
    let mut cfg = Config::default();
    cfg.destination.stream_key = "test-key".to_string();
    cfg.destination.probe_addr = probe_addr.to_string();
    cfg.content.fallback_file = fallback_file;

    cfg.owner.poll_tick.0 = 25;
    cfg.owner.debounce_ms = 300;
    cfg.owner.live_timeout_ms = 250;
    cfg.owner.switch_budget_ms = 1000;

    cfg.monitor.sample_tick.0 = 100;
    cfg.monitor.unresponsive_after_ms = 600;

    cfg.session.status_tick.0 = 100;
    cfg.session.reconnect_ms = 80;

    cfg.failover.switch_budget_ms = 1000;
    cfg.failover.max_engine_restarts = 2;

    cfg.preflight.retry_ms = 150;
    cfg.preflight.probe_timeout_ms = 500;

    cfg.store.reverify_tick_ms = 60_000;
    cfg.store.purge_tick_ms = 3_600_000;
    cfg
}

/// Bring the whole supervisor up against the mock engine. `tweak` runs on
/// the compressed config before anything starts.
pub async fn start(
    engine: Arc<MockEngine>,
    lifecycle_succeeds: bool,
    tweak: impl FnOnce(&mut Config),
) -> Harness {
    let content_dir = tempfile::tempdir().unwrap();
    let fallback_file = content_dir.path().join("fallback.mp4");
    std::fs::write(&fallback_file, b"not really a video").unwrap();

    // Preflight's outbound probe targets this listener.
    let probe_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let probe_addr = probe_listener.local_addr().unwrap();

    let mut cfg = fast_config(fallback_file, probe_addr);
    tweak(&mut cfg);

    let store = Store::open_in_memory().await.unwrap();
    let lifecycle = MockLifecycle::new(engine.clone(), lifecycle_succeeds);
    let provider: Arc<dyn ContentProvider> =
        Arc::new(FallbackProvider::new(&cfg.content.fallback_file));
    let events = liveward::event::channel();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let engine_api: Arc<dyn EngineApi> = engine.clone();
    let lifecycle_api: Arc<dyn ProcessLifecycle> = lifecycle.clone();
    tokio::spawn(liveward::serve_with(
        cfg.clone(),
        store.clone(),
        engine_api,
        provider,
        lifecycle_api,
        events.clone(),
        listener,
        async move {
            let _ = stop_rx.await;
        },
    ));

    Harness {
        cfg,
        store,
        engine,
        lifecycle,
        events,
        http_addr,
        content_dir,
        stop_tx: Some(stop_tx),
        _probe_listener: probe_listener,
    }
}

/// Poll `cond` until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout_ms: u64, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
