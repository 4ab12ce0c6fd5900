//! liveward — a supervisory control daemon that keeps a continuous broadcast
//! alive: preflight validation, streaming ownership, health sampling, fault
//! classification with scene-level recovery, and operator handover, all over
//! one persistent control connection to the broadcast engine.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use chrono::Utc;
use engine::EngineApi;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::content::{CommandLifecycle, ContentProvider, FallbackProvider, LibraryProvider, ProcessLifecycle};
use crate::failover::FailoverManager;
use crate::monitor::HealthMonitor;
use crate::owner::OwnerDetector;
use crate::preflight::PreflightValidator;
use crate::route::AppState;
use crate::session::StreamManager;
use crate::store::model::{DowntimeEvent, OwnerSession, StreamSession};
use crate::store::Store;
use crate::supervisor::SceneArbiter;

pub mod config;
pub mod content;
pub mod error;
pub mod event;
pub mod fault;
pub mod failover;
pub mod log;
pub mod metrics;
pub mod monitor;
pub mod owner;
pub mod preflight;
pub mod result;
pub mod route;
pub mod session;
pub mod signal;
pub mod store;
pub mod supervisor;

/// Production entry: open the store and the real control channel, then hand
/// off to [`serve_with`].
pub async fn server_up<F>(cfg: Config, listener: TcpListener, signal: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = match Store::open(&cfg.store.database).await {
        Ok(store) => store,
        Err(err) => {
            error!(%err, "record store open failed");
            return;
        }
    };
    let channel = engine::Channel::open(cfg.channel_config());
    let engine_api: Arc<dyn EngineApi> = Arc::new(channel);

    let provider: Arc<dyn ContentProvider> = match &cfg.content.library_dir {
        Some(dir) => Arc::new(LibraryProvider::new(dir.clone())),
        None => Arc::new(FallbackProvider::new(&cfg.content.fallback_file)),
    };
    let lifecycle: Arc<dyn ProcessLifecycle> =
        Arc::new(CommandLifecycle::new(cfg.failover.restart_command.clone()));
    let events = event::channel();

    serve_with(
        cfg, store, engine_api, provider, lifecycle, events, listener, signal,
    )
    .await;
}

/// Run the whole supervisor against the given collaborators. The `events`
/// bus is the integration point for fault signals raised outside the
/// supervisor (the content-playback collaborator); tests also drive this
/// with an in-process mock engine.
#[allow(clippy::too_many_arguments)]
pub async fn serve_with<F>(
    cfg: Config,
    store: Store,
    engine: Arc<dyn EngineApi>,
    provider: Arc<dyn ContentProvider>,
    lifecycle: Arc<dyn ProcessLifecycle>,
    events: tokio::sync::broadcast::Sender<event::SupervisorEvent>,
    listener: TcpListener,
    signal: F,
) where
    F: Future<Output = ()> + Send + 'static,
{
    metrics::register();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (arbiter, scene, status_rx) = SceneArbiter::new(
        cfg.clone(),
        engine.clone(),
        store.clone(),
        events.clone(),
    );
    tokio::spawn(arbiter.run(shutdown_rx.clone()));

    let sessions = Arc::new(StreamManager::new(
        cfg.clone(),
        engine.clone(),
        store.clone(),
        events.clone(),
    ));

    let app_state = AppState {
        config: cfg.clone(),
        store: store.clone(),
        status: status_rx.clone(),
        session_state: sessions.state(),
    };
    let app: Router = route::route()
        .with_state(app_state)
        .layer(if cfg.http.cors {
            CorsLayer::permissive()
        } else {
            CorsLayer::new()
        })
        .layer(TraceLayer::new_for_http());

    let pipeline = tokio::spawn(supervise(
        cfg,
        store,
        engine,
        provider,
        lifecycle,
        scene,
        status_rx,
        events,
        sessions,
        shutdown_rx,
    ));

    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .unwrap_or_else(|err| error!("http server error: {err}"));

    let _ = shutdown_tx.send(true);
    let _ = pipeline.await;
}

/// Preflight → stream session → concurrent monitors, then an orderly
/// unwind: every component flushes its own open records, streaming is
/// stopped exactly once, on every exit path.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    cfg: Config,
    store: Store,
    engine: Arc<dyn EngineApi>,
    provider: Arc<dyn ContentProvider>,
    lifecycle: Arc<dyn ProcessLifecycle>,
    scene: supervisor::SceneHandle,
    status_rx: watch::Receiver<supervisor::SupervisorStatus>,
    events: tokio::sync::broadcast::Sender<event::SupervisorEvent>,
    sessions: Arc<StreamManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    reconcile_after_restart(&store).await;

    let preflight = PreflightValidator::new(cfg.clone(), engine.clone(), store.clone());
    let Some(init) = preflight.run_until_passed(&mut shutdown).await else {
        return;
    };

    let session = match sessions.start().await {
        Ok(session) => session,
        Err(err) => {
            error!(%err, init_id = init.id, "streaming start after preflight failed");
            return;
        }
    };
    info!(session_id = session.id, "supervisor is live");

    let monitor = HealthMonitor::new(cfg.clone(), engine.clone(), store.clone(), events.clone());
    let failover = FailoverManager::new(
        cfg.clone(),
        engine.clone(),
        store.clone(),
        scene.clone(),
        status_rx.clone(),
        lifecycle,
        events.clone(),
    );
    let detector = OwnerDetector::new(
        cfg.clone(),
        engine.clone(),
        store.clone(),
        scene,
        status_rx,
        provider,
    );

    let mut tasks = Vec::new();
    {
        let session_id = session.id.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            monitor.run(session_id, shutdown).await;
        }));
    }
    {
        let session_id = session.id.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            failover.run(session_id, shutdown).await;
        }));
    }
    {
        let session_id = session.id.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            detector.run(session_id, shutdown).await;
        }));
    }
    {
        let sessions = sessions.clone();
        let session_id = session.id.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            sessions.run(session_id, shutdown).await;
        }));
    }

    let _ = shutdown.changed().await;
    info!("shutdown requested, unwinding supervisor");
    for task in tasks {
        let _ = task.await;
    }
    sessions.stop(&session.id).await;
}

/// No amnesia: records left open by a previous process are closed so the
/// audit trail stays truthful across restarts.
async fn reconcile_after_restart(store: &Store) {
    let stale = match StreamSession::db_find_open(store.pool()).await {
        Ok(Some(session)) => session,
        _ => return,
    };
    warn!(
        session_id = stale.id,
        "previous run left a session open, closing it"
    );

    if let Ok(Some(mut owner)) = OwnerSession::db_find_open(store.pool(), &stale.id).await {
        owner.close(None);
        let _ = owner.db_update(store.pool()).await;
    }
    if let Ok(Some(mut event)) = DowntimeEvent::db_find_open(store.pool(), &stale.id).await {
        if !event.requires_operator {
            event.close("ended at process restart");
            let _ = event.db_update(store.pool()).await;
        }
    }

    let mut stale = stale;
    stale.touch(Utc::now());
    stale.ended_at = Some(Utc::now());
    let _ = stale.db_update(store.pool()).await;
}
