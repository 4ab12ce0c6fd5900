use crate::store::model::FailureCause;

/// Closed classification of everything that can silence the broadcast.
///
/// Adding a cause is a compile-checked change: the failover dispatch table
/// matches exhaustively on this enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The playing item errored, stalled or went missing.
    Content { detail: String },
    /// The control engine stopped answering.
    Engine { detail: String },
    /// The outbound destination link dropped. `manual` marks a stop that was
    /// observed out-of-band rather than a network drop.
    Destination { manual: bool },
    /// Sustained bandwidth starvation without a hard disconnect.
    NetworkDegraded { detail: String },
    /// Recovery options are exhausted. Carries the cause that led here.
    /// No automatic retry.
    Terminal {
        cause: FailureCause,
        detail: String,
    },
}

impl Fault {
    pub fn cause(&self) -> FailureCause {
        match self {
            Fault::Content { .. } => FailureCause::ContentFailure,
            Fault::Engine { .. } => FailureCause::EngineUnresponsive,
            Fault::Destination { manual: true } => FailureCause::ManualStop,
            Fault::Destination { manual: false } => FailureCause::ConnectionLost,
            Fault::NetworkDegraded { .. } => FailureCause::NetworkDegraded,
            Fault::Terminal { cause, .. } => *cause,
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::Content { detail } => write!(f, "content failure: {}", detail),
            Fault::Engine { detail } => write!(f, "engine unresponsive: {}", detail),
            Fault::Destination { manual: true } => write!(f, "streaming stopped out-of-band"),
            Fault::Destination { manual: false } => write!(f, "destination connection lost"),
            Fault::NetworkDegraded { detail } => write!(f, "network degraded: {}", detail),
            Fault::Terminal { detail, .. } => write!(f, "terminal failure: {}", detail),
        }
    }
}
