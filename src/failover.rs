//! Fault classification and scene-level recovery.
//!
//! Consumes fault signals from the health monitor, the stream session
//! manager and the control channel's own link state, and dispatches on the
//! closed [`Fault`] taxonomy. Every transition opens a durable
//! `DowntimeEvent` at detection time and closes it once a health sample
//! shows streaming + connected again. Nothing recovers without a record.

use std::sync::Arc;
use std::time::Duration;

use engine::EngineApi;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::content::ProcessLifecycle;
use crate::event::SupervisorEvent;
use crate::fault::Fault;
use crate::metrics;
use crate::store::model::{DowntimeEvent, FailureCause, StreamSession};
use crate::store::Store;
use crate::supervisor::{SceneHandle, SupervisorStatus, SwitchClass, SwitchOutcome};

/// Await the next engine event, or park forever once the subscription is
/// gone so the select loop keeps serving the other arms.
async fn next_engine_event(
    rx: &mut Option<broadcast::Receiver<engine::Event>>,
) -> Option<engine::Event> {
    match rx {
        Some(receiver) => match receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => None,
            Err(broadcast::error::RecvError::Closed) => {
                *rx = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}

fn classify_engine_event(event: Option<engine::Event>) -> Option<Fault> {
    match event? {
        engine::Event::ConnectionState { connected: false } => {
            Some(Fault::Destination { manual: false })
        }
        engine::Event::StreamState {
            active: false,
            reconnecting,
        } => Some(Fault::Destination {
            manual: !reconnecting,
        }),
        _ => None,
    }
}

pub struct FailoverManager {
    cfg: Config,
    engine: Arc<dyn EngineApi>,
    store: Store,
    scene: SceneHandle,
    status: watch::Receiver<SupervisorStatus>,
    lifecycle: Arc<dyn ProcessLifecycle>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl FailoverManager {
    pub fn new(
        cfg: Config,
        engine: Arc<dyn EngineApi>,
        store: Store,
        scene: SceneHandle,
        status: watch::Receiver<SupervisorStatus>,
        lifecycle: Arc<dyn ProcessLifecycle>,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            cfg,
            engine,
            store,
            scene,
            status,
            lifecycle,
            events,
        }
    }

    pub async fn run(&self, session_id: String, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.events.subscribe();
        let mut link = self.engine.link_state();
        let mut link_down_since: Option<Instant> = None;
        let unresponsive_after = Duration::from_millis(self.cfg.monitor.unresponsive_after_ms);

        // Push-style disconnect signals from the engine, alongside the
        // polling paths.
        let _ = self.engine.subscribe(engine::EventKind::ConnectionState).await;
        let mut engine_events = self
            .engine
            .subscribe(engine::EventKind::StreamState)
            .await
            .ok();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(SupervisorEvent::PossibleFailure(fault)) => {
                        self.handle_fault(&session_id, fault).await;
                    }
                    Ok(SupervisorEvent::Recovered) => self.confirm_recovery(&session_id).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "failover event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                engine_event = next_engine_event(&mut engine_events) => {
                    if let Some(fault) = classify_engine_event(engine_event) {
                        self.handle_fault(&session_id, fault).await;
                    }
                }
                _ = link.changed() => {
                    if link.borrow().is_connected() {
                        link_down_since = None;
                    } else if link_down_since.is_none() {
                        link_down_since = Some(Instant::now());
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)), if link_down_since.is_some() => {
                    let down_for = link_down_since.map(|since| since.elapsed()).unwrap_or_default();
                    if down_for > unresponsive_after {
                        link_down_since = Some(Instant::now());
                        self.handle_fault(
                            &session_id,
                            Fault::Engine {
                                detail: format!(
                                    "control link down for {} ms",
                                    down_for.as_millis()
                                ),
                            },
                        )
                        .await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.flush_at_shutdown(&session_id).await;
    }

    /// The dispatch table. One arm per cause; adding a cause is a
    /// compile-checked change.
    ///
    /// Destination faults are record-only here: reconnection belongs to the
    /// stream session manager, and duplicating its retry loop would race it.
    async fn handle_fault(&self, session_id: &str, fault: Fault) {
        warn!(%fault, "fault classified");
        match fault {
            Fault::Content { detail } => {
                let in_fallback = self.status.borrow().scene == self.cfg.scenes.fallback;
                if in_fallback {
                    // Primary already failed over; the fallback item failing
                    // too is the one terminal state in the supervisor.
                    self.escalate_terminal(
                        session_id,
                        FailureCause::ContentFailure,
                        &format!("fallback content failed as well: {}", detail),
                    )
                    .await;
                    return;
                }
                self.open_event(
                    session_id,
                    FailureCause::ContentFailure,
                    &format!("switching to fallback scene: {}", detail),
                )
                .await;
                let outcome = self
                    .scene
                    .request(
                        &self.cfg.scenes.fallback,
                        SwitchClass::Recovery,
                        &detail,
                        Instant::now(),
                        Some(Duration::from_millis(self.cfg.failover.switch_budget_ms)),
                    )
                    .await;
                match outcome {
                    SwitchOutcome::Switched { .. } => {}
                    SwitchOutcome::Denied { holder } => {
                        // The owner has the air; automated content is moot.
                        info!(?holder, "fallback switch denied by scene holder");
                    }
                    SwitchOutcome::Failed { error } => {
                        self.escalate_terminal(
                            session_id,
                            FailureCause::ContentFailure,
                            &format!("fallback scene switch failed: {}", error),
                        )
                        .await;
                    }
                }
            }
            Fault::Engine { detail } => {
                self.open_event(session_id, FailureCause::EngineUnresponsive, &detail)
                    .await;
                let max_attempts = self.cfg.failover.max_engine_restarts;
                let mut recovered = false;
                for attempt in 1..=max_attempts {
                    info!(attempt, max_attempts, "restarting broadcast engine");
                    match self.lifecycle.restart("engine").await {
                        Ok(()) => {
                            if self.wait_engine_back().await {
                                info!(attempt, "engine responding again");
                                if let Err(err) = self.engine.start_stream().await {
                                    warn!(%err, "stream restart after engine recovery failed");
                                }
                                recovered = true;
                                break;
                            }
                            warn!(attempt, "engine still silent after restart");
                        }
                        Err(err) => warn!(attempt, %err, "engine restart attempt failed"),
                    }
                }
                if !recovered {
                    self.escalate_terminal(
                        session_id,
                        FailureCause::EngineUnresponsive,
                        "engine restart attempts exhausted",
                    )
                    .await;
                }
            }
            Fault::Destination { manual } => {
                // Reconnection belongs to the stream session manager; this
                // only guarantees the durable record exists.
                let cause = if manual {
                    FailureCause::ManualStop
                } else {
                    FailureCause::ConnectionLost
                };
                let action = if manual {
                    "out-of-band stop observed, stream restart issued"
                } else {
                    "destination reconnect loop engaged"
                };
                self.open_event(session_id, cause, action).await;
            }
            Fault::NetworkDegraded { detail } => {
                self.open_event(session_id, FailureCause::NetworkDegraded, &detail)
                    .await;
            }
            Fault::Terminal { cause, detail } => {
                self.escalate_terminal(session_id, cause, &detail).await;
            }
        }
    }

    /// Poll the engine until it answers again, bounded by the unresponsive
    /// window.
    async fn wait_engine_back(&self) -> bool {
        let deadline =
            Instant::now() + Duration::from_millis(self.cfg.monitor.unresponsive_after_ms);
        while Instant::now() < deadline {
            if self.engine.stream_status().await.is_ok() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        false
    }

    /// Open a downtime event unless one is already open for this session.
    async fn open_event(&self, session_id: &str, cause: FailureCause, action: &str) {
        match DowntimeEvent::db_find_open(self.store.pool(), session_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let event = DowntimeEvent::open(session_id, cause, action);
                if let Err(err) = event.db_insert(self.store.pool()).await {
                    warn!(%err, "downtime event write failed");
                } else {
                    metrics::DOWNTIME_EVENTS.inc();
                    warn!(event_id = event.id, %cause, action, "downtime event opened");
                }
            }
            Err(err) => warn!(%err, "downtime event lookup failed"),
        }
    }

    /// A healthy sample arrived; close the open event if it does not need an
    /// operator.
    async fn confirm_recovery(&self, session_id: &str) {
        let open = match DowntimeEvent::db_find_open(self.store.pool(), session_id).await {
            Ok(Some(event)) if !event.requires_operator => event,
            _ => return,
        };
        let mut event = open;
        event.close("stream healthy again");
        if let Err(err) = event.db_update(self.store.pool()).await {
            warn!(%err, "downtime event close failed");
            return;
        }
        metrics::RECOVERIES.inc();
        info!(
            event_id = event.id,
            cause = %event.cause,
            duration_sec = event.duration_sec,
            "downtime event closed"
        );

        // Fold the outage into the session's downtime total.
        match StreamSession::db_find_by_id(self.store.pool(), session_id).await {
            Ok(Some(mut session)) => {
                session.touch(chrono::Utc::now());
                session.add_downtime(event.duration_sec.ceil() as i64);
                if let Err(err) = session.db_update(self.store.pool()).await {
                    warn!(%err, "session downtime update failed");
                }
            }
            Ok(None) => {}
            Err(err) => warn!(%err, "session downtime lookup failed"),
        }
    }

    /// Both recovery paths are gone: park on the technical-difficulties
    /// scene and leave the event open for an operator.
    async fn escalate_terminal(&self, session_id: &str, cause: FailureCause, detail: &str) {
        error!(%cause, detail, "terminal failure, manual intervention required");
        let outcome = self
            .scene
            .request(
                &self.cfg.scenes.technical_difficulties,
                SwitchClass::Terminal,
                detail,
                Instant::now(),
                None,
            )
            .await;
        if let SwitchOutcome::Failed { error } = outcome {
            error!(error, "technical difficulties scene switch failed");
        }

        match DowntimeEvent::db_find_open(self.store.pool(), session_id).await {
            Ok(Some(mut event)) => {
                event.requires_operator = true;
                event.automatic_recovery = false;
                event.recovery_action =
                    format!("{} -> technical difficulties: {}", event.recovery_action, detail);
                if let Err(err) = event.db_update(self.store.pool()).await {
                    warn!(%err, "terminal event update failed");
                }
            }
            Ok(None) => {
                let mut event = DowntimeEvent::open(
                    session_id,
                    cause,
                    &format!("technical difficulties: {}", detail),
                );
                event.requires_operator = true;
                event.automatic_recovery = false;
                if let Err(err) = event.db_insert(self.store.pool()).await {
                    warn!(%err, "terminal event write failed");
                } else {
                    metrics::DOWNTIME_EVENTS.inc();
                }
            }
            Err(err) => warn!(%err, "terminal event lookup failed"),
        }
    }

    /// Planned shutdown: close the open event so nothing dangles, except a
    /// terminal event, which stays open for the operator.
    async fn flush_at_shutdown(&self, session_id: &str) {
        if let Ok(Some(mut event)) = DowntimeEvent::db_find_open(self.store.pool(), session_id).await
        {
            if event.requires_operator {
                return;
            }
            event.close("ended at shutdown");
            if let Err(err) = event.db_update(self.store.pool()).await {
                warn!(%err, "shutdown event flush failed");
            }
        }
    }
}
