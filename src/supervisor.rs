//! Single writer of the engine's active scene.
//!
//! Every other component *requests* a switch and awaits the outcome; the
//! arbiter serializes requests, enforces the preemption rules and confirms
//! each change by reading the active scene back from the engine before the
//! request counts as satisfied.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engine::EngineApi;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::event::SupervisorEvent;
use crate::metrics;
use crate::preflight;
use crate::store::model::HealthMetric;
use crate::store::Store;

/// Who is asking, which decides who may preempt whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchClass {
    /// Scheduled content rotation on the automated path.
    Automated,
    /// Failover recovery targeting the automated path (fallback scene and
    /// the switch back).
    Recovery,
    /// Operator seizing the broadcast.
    OwnerTake,
    /// Operator handing the broadcast back.
    OwnerRelease,
    /// Broadcast survival: engine-unresponsive escalation, terminal scene.
    Terminal,
}

/// Which actor currently holds the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hold {
    Automated,
    Owner,
    Terminal,
}

/// Owner preempts recovery on the automated path; terminal preempts
/// everything, including an active owner session.
fn permits(hold: Hold, class: SwitchClass) -> bool {
    match (hold, class) {
        (_, SwitchClass::Terminal) => true,
        (Hold::Terminal, _) => false,
        (Hold::Owner, SwitchClass::OwnerTake) => true,
        (Hold::Owner, SwitchClass::OwnerRelease) => true,
        (Hold::Owner, _) => false,
        (Hold::Automated, SwitchClass::OwnerRelease) => false,
        (Hold::Automated, _) => true,
    }
}

fn hold_after(hold: Hold, class: SwitchClass) -> Hold {
    match class {
        SwitchClass::OwnerTake => Hold::Owner,
        SwitchClass::OwnerRelease => Hold::Automated,
        SwitchClass::Terminal => Hold::Terminal,
        SwitchClass::Automated | SwitchClass::Recovery => hold,
    }
}

#[derive(Debug)]
pub enum SwitchOutcome {
    Switched { scene: String, elapsed: Duration },
    Denied { holder: Hold },
    Failed { error: String },
}

pub struct SceneRequest {
    pub scene: String,
    pub class: SwitchClass,
    pub reason: String,
    /// When the triggering condition was first observed; budgets are
    /// measured from here, not from request submission.
    pub detected_at: Instant,
    pub budget: Option<Duration>,
    pub respond_to: oneshot::Sender<SwitchOutcome>,
}

#[derive(Debug, Clone)]
pub struct SupervisorStatus {
    pub scene: String,
    pub hold: Hold,
}

impl SupervisorStatus {
    pub fn owner_live(&self) -> bool {
        self.hold == Hold::Owner
    }
}

#[derive(Clone)]
pub struct SceneHandle {
    tx: mpsc::Sender<SceneRequest>,
}

impl SceneHandle {
    pub async fn request(
        &self,
        scene: &str,
        class: SwitchClass,
        reason: &str,
        detected_at: Instant,
        budget: Option<Duration>,
    ) -> SwitchOutcome {
        let (respond_to, response) = oneshot::channel();
        let request = SceneRequest {
            scene: scene.to_string(),
            class,
            reason: reason.to_string(),
            detected_at,
            budget,
            respond_to,
        };
        if self.tx.send(request).await.is_err() {
            return SwitchOutcome::Failed {
                error: "scene arbiter is gone".to_string(),
            };
        }
        response.await.unwrap_or(SwitchOutcome::Failed {
            error: "scene arbiter dropped the request".to_string(),
        })
    }
}

pub struct SceneArbiter {
    cfg: Config,
    engine: Arc<dyn EngineApi>,
    store: Store,
    rx: mpsc::Receiver<SceneRequest>,
    status_tx: watch::Sender<SupervisorStatus>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl SceneArbiter {
    pub fn new(
        cfg: Config,
        engine: Arc<dyn EngineApi>,
        store: Store,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> (Self, SceneHandle, watch::Receiver<SupervisorStatus>) {
        let (tx, rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(SupervisorStatus {
            scene: cfg.scenes.automated.clone(),
            hold: Hold::Automated,
        });
        let arbiter = Self {
            cfg,
            engine,
            store,
            rx,
            status_tx,
            events,
        };
        (arbiter, SceneHandle { tx }, status_rx)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(scene) = self.engine.active_scene().await {
            self.publish(scene, Hold::Automated);
        }

        let reverify_period = Duration::from_millis(self.cfg.store.reverify_tick_ms);
        let mut reverify = tokio::time::interval_at(Instant::now() + reverify_period, reverify_period);
        reverify.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let purge_period = Duration::from_millis(self.cfg.store.purge_tick_ms);
        let mut purge = tokio::time::interval_at(Instant::now() + purge_period, purge_period);
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = reverify.tick() => {
                    if let Err(err) =
                        preflight::ensure_scenes(&self.cfg, self.engine.as_ref(), &self.store).await
                    {
                        warn!(%err, "scene re-verification failed");
                    }
                }
                _ = purge.tick() => self.purge_metrics().await,
                _ = shutdown.changed() => break,
            }
        }
        debug!("scene arbiter stopped");
    }

    async fn handle(&mut self, request: SceneRequest) {
        let hold = self.status_tx.borrow().hold;
        if !permits(hold, request.class) {
            info!(
                scene = request.scene,
                class = ?request.class,
                ?hold,
                reason = request.reason,
                "scene request denied by current holder"
            );
            let _ = request.respond_to.send(SwitchOutcome::Denied { holder: hold });
            return;
        }

        if let Err(err) = self.engine.set_active_scene(&request.scene).await {
            error!(scene = request.scene, %err, "scene switch failed");
            let _ = request.respond_to.send(SwitchOutcome::Failed {
                error: err.to_string(),
            });
            return;
        }

        match self.confirm(&request.scene).await {
            Ok(()) => {
                let elapsed = request.detected_at.elapsed();
                if let Some(budget) = request.budget {
                    if elapsed > budget {
                        metrics::BUDGET_OVERRUNS.inc();
                        warn!(
                            scene = request.scene,
                            elapsed_ms = elapsed.as_millis() as u64,
                            budget_ms = budget.as_millis() as u64,
                            reason = request.reason,
                            "scene switch confirmed past its budget"
                        );
                    }
                }
                let next_hold = hold_after(hold, request.class);
                info!(
                    scene = request.scene,
                    class = ?request.class,
                    elapsed_ms = elapsed.as_millis() as u64,
                    reason = request.reason,
                    "scene switch confirmed"
                );
                self.publish(request.scene.clone(), next_hold);
                let _ = self.events.send(SupervisorEvent::SceneChanged {
                    scene: request.scene.clone(),
                });
                let _ = request.respond_to.send(SwitchOutcome::Switched {
                    scene: request.scene,
                    elapsed,
                });
            }
            Err(error) => {
                error!(scene = request.scene, error, "scene switch not confirmed");
                let _ = request.respond_to.send(SwitchOutcome::Failed { error });
            }
        }
    }

    /// Read the active scene back until it matches the request.
    async fn confirm(&self, scene: &str) -> Result<(), String> {
        for _ in 0..10 {
            match self.engine.active_scene().await {
                Ok(active) if active == scene => return Ok(()),
                Ok(_) => {}
                Err(err) => return Err(err.to_string()),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(format!("active scene never became '{}'", scene))
    }

    fn publish(&self, scene: String, hold: Hold) {
        metrics::OWNER_LIVE.set(if hold == Hold::Owner { 1.0 } else { 0.0 });
        let _ = self.status_tx.send(SupervisorStatus { scene, hold });
    }

    async fn purge_metrics(&self) {
        let cutoff = Utc::now() - chrono::Duration::days(self.cfg.store.retention_days as i64);
        match HealthMetric::db_purge_older_than(self.store.pool(), cutoff).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "archived old health metrics"),
            Err(err) => warn!(%err, "health metric purge failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_preempts_recovery_but_not_terminal() {
        assert!(permits(Hold::Automated, SwitchClass::Recovery));
        assert!(permits(Hold::Automated, SwitchClass::OwnerTake));
        // An active owner session blocks the automated-path recovery...
        assert!(!permits(Hold::Owner, SwitchClass::Recovery));
        assert!(!permits(Hold::Owner, SwitchClass::Automated));
        // ...but never blocks broadcast survival.
        assert!(permits(Hold::Owner, SwitchClass::Terminal));
        assert!(permits(Hold::Automated, SwitchClass::Terminal));
    }

    #[test]
    fn terminal_hold_is_sticky() {
        assert!(!permits(Hold::Terminal, SwitchClass::Automated));
        assert!(!permits(Hold::Terminal, SwitchClass::Recovery));
        assert!(!permits(Hold::Terminal, SwitchClass::OwnerTake));
        assert!(permits(Hold::Terminal, SwitchClass::Terminal));
    }

    #[test]
    fn release_requires_an_owner_hold() {
        assert!(permits(Hold::Owner, SwitchClass::OwnerRelease));
        assert!(!permits(Hold::Automated, SwitchClass::OwnerRelease));
    }

    #[test]
    fn hold_follows_the_accepted_class() {
        assert_eq!(hold_after(Hold::Automated, SwitchClass::OwnerTake), Hold::Owner);
        assert_eq!(hold_after(Hold::Owner, SwitchClass::OwnerRelease), Hold::Automated);
        assert_eq!(hold_after(Hold::Owner, SwitchClass::Terminal), Hold::Terminal);
        assert_eq!(hold_after(Hold::Automated, SwitchClass::Recovery), Hold::Automated);
    }
}
