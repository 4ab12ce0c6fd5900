//! Owner-presence detection and broadcast handover.
//!
//! Polls the designated owner sources, debounces the raw signal through an
//! explicit state machine, and drives the take/release handover through the
//! scene arbiter. A flicker shorter than the debounce window never reaches
//! the arbiter and never produces an `OwnerSession`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engine::{EngineApi, SourceActive};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::content::{ContentProvider, ItemConstraints, TimeBlock};
use crate::store::model::OwnerSession;
use crate::store::Store;
use crate::supervisor::{SceneHandle, SupervisorStatus, SwitchClass, SwitchOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebounceState {
    Inactive,
    Debouncing { target_active: bool, since: Instant },
    Active,
}

/// A confirmed state change, carrying the instant the raw signal first
/// flipped — transition budgets are measured from there.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub active: bool,
    pub since: Instant,
}

/// Requires a raw signal to persist for the whole window before promoting
/// it to a real state change.
#[derive(Debug, Clone, Copy)]
pub struct Debounce {
    window: Duration,
    state: DebounceState,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: DebounceState::Inactive,
        }
    }

    pub fn observe(&mut self, now: Instant, raw_active: bool) -> Option<Transition> {
        match self.state {
            DebounceState::Inactive => {
                if raw_active {
                    self.state = DebounceState::Debouncing {
                        target_active: true,
                        since: now,
                    };
                }
                None
            }
            DebounceState::Active => {
                if !raw_active {
                    self.state = DebounceState::Debouncing {
                        target_active: false,
                        since: now,
                    };
                }
                None
            }
            DebounceState::Debouncing {
                target_active,
                since,
            } => {
                if raw_active != target_active {
                    // Flicker: fall back to the settled state.
                    self.state = if target_active {
                        DebounceState::Inactive
                    } else {
                        DebounceState::Active
                    };
                    return None;
                }
                if now.duration_since(since) >= self.window {
                    self.state = if target_active {
                        DebounceState::Active
                    } else {
                        DebounceState::Inactive
                    };
                    return Some(Transition {
                        active: target_active,
                        since,
                    });
                }
                None
            }
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            DebounceState::Active
                | DebounceState::Debouncing {
                    target_active: false,
                    ..
                }
        )
    }
}

/// Standby-overlay watchdog state while the owner holds the air.
struct LiveWatch {
    deadline: Instant,
    standby_shown: bool,
}

pub struct OwnerDetector {
    cfg: Config,
    engine: Arc<dyn EngineApi>,
    store: Store,
    scene: SceneHandle,
    status: watch::Receiver<SupervisorStatus>,
    provider: Arc<dyn ContentProvider>,
}

impl OwnerDetector {
    pub fn new(
        cfg: Config,
        engine: Arc<dyn EngineApi>,
        store: Store,
        scene: SceneHandle,
        status: watch::Receiver<SupervisorStatus>,
        provider: Arc<dyn ContentProvider>,
    ) -> Self {
        Self {
            cfg,
            engine,
            store,
            scene,
            status,
            provider,
        }
    }

    pub async fn run(&self, session_id: String, mut shutdown: watch::Receiver<bool>) {
        let tick = Duration::from_millis(self.cfg.owner.poll_tick.0);
        let mut debounce = Debounce::new(Duration::from_millis(self.cfg.owner.debounce_ms));
        let mut live_watch: Option<LiveWatch> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => break,
            }

            let raw = self.poll_sources().await;

            if let Some(transition) = debounce.observe(Instant::now(), raw.active) {
                if transition.active {
                    self.owner_takes(&session_id, transition.since, &mut live_watch)
                        .await;
                } else {
                    self.owner_releases(&session_id, &mut live_watch).await;
                }
            }

            self.tend_standby(raw, &mut live_watch).await;
        }

        // An owner session open at shutdown is flushed, not left dangling.
        if let Ok(Some(mut open)) = OwnerSession::db_find_open(self.store.pool(), &session_id).await
        {
            open.close(None);
            if let Err(err) = open.db_update(self.store.pool()).await {
                warn!(%err, "owner session flush failed");
            }
        }
    }

    /// One poll across every configured owner source. A source that cannot
    /// be queried counts as inactive.
    async fn poll_sources(&self) -> SourceActive {
        let mut aggregate = SourceActive {
            active: false,
            live: false,
        };
        for source in &self.cfg.owner.sources {
            match self.engine.source_active(source).await {
                Ok(state) => {
                    aggregate.active |= state.active;
                    aggregate.live |= state.live;
                }
                Err(err) => debug!(source, %err, "owner source poll failed"),
            }
        }
        aggregate
    }

    async fn owner_takes(
        &self,
        session_id: &str,
        since: Instant,
        live_watch: &mut Option<LiveWatch>,
    ) {
        let interrupted = self.status.borrow().scene.clone();
        let outcome = self
            .scene
            .request(
                &self.cfg.scenes.owner,
                SwitchClass::OwnerTake,
                "owner sources active past debounce",
                since,
                Some(Duration::from_millis(self.cfg.owner.switch_budget_ms)),
            )
            .await;

        match outcome {
            SwitchOutcome::Switched { elapsed, .. } => {
                let session =
                    OwnerSession::open(session_id, Some(interrupted), elapsed.as_secs_f64());
                match session.db_insert(self.store.pool()).await {
                    Ok(()) => info!(
                        owner_session_id = session.id,
                        transition_sec = session.transition_time_sec,
                        "owner is live"
                    ),
                    Err(err) => warn!(%err, "owner session write failed"),
                }
                *live_watch = Some(LiveWatch {
                    deadline: Instant::now()
                        + Duration::from_millis(self.cfg.owner.live_timeout_ms),
                    standby_shown: false,
                });
            }
            SwitchOutcome::Denied { holder } => {
                warn!(?holder, "owner takeover denied by scene holder");
            }
            SwitchOutcome::Failed { error } => {
                error!(error, "owner scene switch failed");
            }
        }
    }

    async fn owner_releases(&self, session_id: &str, live_watch: &mut Option<LiveWatch>) {
        if let Some(state) = live_watch.take() {
            if state.standby_shown {
                self.set_standby(false).await;
            }
        }

        // Ask the content provider what belongs on air now.
        let item = match self
            .provider
            .next_item(TimeBlock::at(Utc::now()), &ItemConstraints::default())
            .await
        {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(%err, "content provider gave no resume item");
                None
            }
        };

        if let Some(item) = &item {
            let settings = json!({
                "localFile": item.file_path.display().to_string(),
                "looping": false,
            });
            if let Err(err) = self
                .engine
                .set_source_settings(&self.cfg.scenes.content_source, settings)
                .await
            {
                warn!(%err, "content source update failed");
            }
            let overlay = json!({ "text": item.overlay_text() });
            if let Err(err) = self
                .engine
                .set_source_settings(&self.cfg.scenes.attribution_source, overlay)
                .await
            {
                debug!(%err, "attribution overlay update failed");
            }
        }

        let outcome = self
            .scene
            .request(
                &self.cfg.scenes.automated,
                SwitchClass::OwnerRelease,
                "owner sources inactive past debounce",
                Instant::now(),
                Some(Duration::from_millis(self.cfg.owner.switch_budget_ms)),
            )
            .await;

        match outcome {
            SwitchOutcome::Switched { .. } => {
                match OwnerSession::db_find_open(self.store.pool(), session_id).await {
                    Ok(Some(mut open)) => {
                        let resume = item.as_ref().map(|item| {
                            item.title
                                .clone()
                                .unwrap_or_else(|| item.file_path.display().to_string())
                        });
                        open.close(resume);
                        match open.db_update(self.store.pool()).await {
                            Ok(()) => info!(
                                owner_session_id = open.id,
                                duration_sec = open.duration_sec,
                                "owner session closed, automated programming resumed"
                            ),
                            Err(err) => warn!(%err, "owner session close failed"),
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(%err, "owner session lookup failed"),
                }
            }
            SwitchOutcome::Denied { holder } => {
                warn!(?holder, "automated resume denied by scene holder");
            }
            SwitchOutcome::Failed { error } => {
                error!(error, "automated resume scene switch failed");
            }
        }
    }

    /// If the owner is on air but the signal never becomes properly live,
    /// show the standby overlay instead of aborting the takeover.
    async fn tend_standby(&self, raw: SourceActive, live_watch: &mut Option<LiveWatch>) {
        let Some(state) = live_watch else {
            return;
        };
        if raw.live {
            if state.standby_shown {
                self.set_standby(false).await;
            }
            *live_watch = None;
        } else if Instant::now() >= state.deadline && !state.standby_shown {
            info!("owner signal not properly live, showing standby overlay");
            self.set_standby(true).await;
            state.standby_shown = true;
        }
    }

    async fn set_standby(&self, enabled: bool) {
        if let Err(err) = self
            .engine
            .set_source_enabled(&self.cfg.scenes.standby_source, enabled)
            .await
        {
            warn!(enabled, %err, "standby overlay toggle failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn flicker_shorter_than_window_is_rejected() {
        let t0 = Instant::now();
        let mut debounce = Debounce::new(Duration::from_millis(5000));
        assert!(debounce.observe(at(t0, 0), true).is_none());
        assert!(debounce.observe(at(t0, 1000), true).is_none());
        // Drops out after 2 s: back to square one, no transition ever.
        assert!(debounce.observe(at(t0, 2000), false).is_none());
        assert!(debounce.observe(at(t0, 3000), false).is_none());
        assert!(!debounce.is_active());
    }

    #[test]
    fn held_activation_promotes_once() {
        let t0 = Instant::now();
        let mut debounce = Debounce::new(Duration::from_millis(5000));
        assert!(debounce.observe(at(t0, 0), true).is_none());
        assert!(debounce.observe(at(t0, 2500), true).is_none());
        let transition = debounce.observe(at(t0, 5000), true).unwrap();
        assert!(transition.active);
        assert_eq!(transition.since, at(t0, 0));
        assert!(debounce.is_active());
        // Staying active yields nothing further.
        assert!(debounce.observe(at(t0, 6000), true).is_none());
    }

    #[test]
    fn deactivation_debounces_symmetrically() {
        let t0 = Instant::now();
        let mut debounce = Debounce::new(Duration::from_millis(5000));
        debounce.observe(at(t0, 0), true);
        debounce.observe(at(t0, 5000), true).unwrap();

        assert!(debounce.observe(at(t0, 10_000), false).is_none());
        // Source returns before the window elapses: still active.
        assert!(debounce.observe(at(t0, 12_000), true).is_none());
        assert!(debounce.is_active());

        assert!(debounce.observe(at(t0, 20_000), false).is_none());
        let transition = debounce.observe(at(t0, 25_000), false).unwrap();
        assert!(!transition.active);
        assert!(!debounce.is_active());
    }

    #[test]
    fn transition_budget_is_measured_from_first_flip() {
        let t0 = Instant::now();
        let mut debounce = Debounce::new(Duration::from_millis(300));
        debounce.observe(at(t0, 0), true);
        let transition = debounce.observe(at(t0, 400), true).unwrap();
        assert_eq!(transition.since, at(t0, 0));
    }
}
