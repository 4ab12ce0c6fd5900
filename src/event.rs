use tokio::sync::broadcast;

use crate::fault::Fault;

/// Events flowing between the supervisor's components.
///
/// Observation-side components (health monitor, stream session manager)
/// publish; the failover manager consumes. Everything also lands in the log.
#[derive(Clone, Debug)]
pub enum SupervisorEvent {
    /// A hard fault signal; the failover manager classifies and acts.
    PossibleFailure(Fault),
    /// Soft quality warning. Observational only, never triggers failover.
    QualityDegraded { dropped_frames_pct: f64 },
    /// A health sample showed streaming + connected again.
    Recovered,
    /// The supervisor confirmed a scene switch.
    SceneChanged { scene: String },
}

pub fn channel() -> broadcast::Sender<SupervisorEvent> {
    let (tx, _) = broadcast::channel(64);
    tx
}
