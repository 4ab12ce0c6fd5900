//! On-air/off-air ownership and destination-level reconnection.
//!
//! The session manager never waits for a human: an out-of-band stop is an
//! anomaly that gets logged and reverted, and a dropped destination link is
//! retried on a fixed cadence without tearing down local playback.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engine::EngineApi;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::event::SupervisorEvent;
use crate::fault::Fault;
use crate::metrics;
use crate::result::Result;
use crate::store::model::{HealthMetric, StreamSession};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Live,
    Reconnecting,
}

pub struct StreamManager {
    cfg: Config,
    engine: Arc<dyn EngineApi>,
    store: Store,
    events: broadcast::Sender<SupervisorEvent>,
    state_tx: watch::Sender<SessionState>,
}

impl StreamManager {
    pub fn new(
        cfg: Config,
        engine: Arc<dyn EngineApi>,
        store: Store,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            cfg,
            engine,
            store,
            events,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Go on air and open the session record.
    pub async fn start(&self) -> Result<StreamSession> {
        let _ = self.state_tx.send(SessionState::Starting);
        self.engine.start_stream().await?;

        let session = StreamSession::begin();
        session.db_insert(self.store.pool()).await?;
        metrics::STREAMING.set(1.0);
        let _ = self.state_tx.send(SessionState::Live);
        info!(session_id = session.id, "streaming started");
        Ok(session)
    }

    /// Fixed-cadence status polling; 30 s while live, 10 s while the
    /// destination link is being re-established.
    pub async fn run(&self, session_id: String, mut shutdown: watch::Receiver<bool>) {
        loop {
            let delay = match *self.state_tx.borrow() {
                SessionState::Reconnecting => Duration::from_millis(self.cfg.session.reconnect_ms),
                _ => Duration::from_millis(self.cfg.session.status_tick.0),
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            self.poll(&session_id).await;
        }
    }

    async fn poll(&self, session_id: &str) {
        let state = *self.state_tx.borrow();
        match self.engine.stream_status().await {
            Ok(status) => match (state, status.active, status.reconnecting) {
                (SessionState::Live, true, _) => {}
                (SessionState::Live, false, true) => {
                    warn!("destination link dropped, engine is reconnecting");
                    let _ = self.state_tx.send(SessionState::Reconnecting);
                    let _ = self
                        .events
                        .send(SupervisorEvent::PossibleFailure(Fault::Destination {
                            manual: false,
                        }));
                }
                (SessionState::Live, false, false) => {
                    // Out-of-band stop. The continuity invariant says we
                    // restart, not wait for whoever stopped it.
                    warn!("streaming stopped out-of-band, restarting");
                    let _ = self
                        .events
                        .send(SupervisorEvent::PossibleFailure(Fault::Destination {
                            manual: true,
                        }));
                    if let Err(err) = self.engine.start_stream().await {
                        error!(%err, "restart after out-of-band stop failed");
                        let _ = self.state_tx.send(SessionState::Reconnecting);
                    }
                }
                (SessionState::Reconnecting, true, _) => {
                    info!("destination link re-established");
                    let _ = self.state_tx.send(SessionState::Live);
                }
                (SessionState::Reconnecting, false, true) => {}
                (SessionState::Reconnecting, false, false) => {
                    // The engine gave up on its own retries; kick it again.
                    if let Err(err) = self.engine.start_stream().await {
                        warn!(%err, "destination reconnect attempt failed");
                    }
                }
                _ => {}
            },
            Err(err) => {
                // Channel faults are the health monitor's signal to handle.
                warn!(%err, "stream status poll failed");
            }
        }
        self.refresh_session(session_id).await;
    }

    /// Keep the running totals and quality aggregates current.
    async fn refresh_session(&self, session_id: &str) {
        let session = match StreamSession::db_find_by_id(self.store.pool(), session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(err) => {
                warn!(%err, "session refresh read failed");
                return;
            }
        };
        let mut session = session;
        session.touch(Utc::now());
        if let Ok((avg_bitrate, avg_dropped, peak_cpu)) =
            HealthMetric::db_aggregate(self.store.pool(), session_id).await
        {
            session.avg_bitrate_kbps = avg_bitrate;
            session.avg_dropped_frames_pct = avg_dropped;
            session.peak_cpu_pct = peak_cpu;
        }
        if let Err(err) = session.db_update(self.store.pool()).await {
            warn!(%err, "session refresh write failed");
        }
    }

    /// Go off air and finalize the session record. Called on every exit
    /// path, including crash-induced restarts that find an open session.
    pub async fn stop(&self, session_id: &str) {
        let _ = self.state_tx.send(SessionState::Idle);
        metrics::STREAMING.set(0.0);
        if let Err(err) = self.engine.stop_stream().await {
            warn!(%err, "stop streaming failed");
        }
        match StreamSession::db_find_by_id(self.store.pool(), session_id).await {
            Ok(Some(mut session)) => {
                session.touch(Utc::now());
                session.ended_at = Some(Utc::now());
                if let Ok((avg_bitrate, avg_dropped, peak_cpu)) =
                    HealthMetric::db_aggregate(self.store.pool(), session_id).await
                {
                    session.avg_bitrate_kbps = avg_bitrate;
                    session.avg_dropped_frames_pct = avg_dropped;
                    session.peak_cpu_pct = peak_cpu;
                }
                if let Err(err) = session.db_update(self.store.pool()).await {
                    warn!(%err, "session finalize failed");
                } else {
                    info!(
                        session_id,
                        duration_sec = session.total_duration_sec,
                        uptime_pct = session.uptime_pct(),
                        "stream session finalized"
                    );
                }
            }
            Ok(None) => {}
            Err(err) => warn!(%err, "session finalize read failed"),
        }
    }
}
