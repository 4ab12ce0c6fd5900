use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;

use crate::config::Config;
use crate::metrics;
use crate::session::SessionState;
use crate::store::Store;
use crate::supervisor::SupervisorStatus;

pub mod health;
pub mod report;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub status: watch::Receiver<SupervisorStatus>,
    pub session_state: watch::Receiver<SessionState>,
}

pub fn route() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health::snapshot))
        .route("/api/report", get(report::uptime))
        .route("/metrics", get(metrics_text))
}

async fn metrics_text(State(_state): State<AppState>) -> String {
    metrics::ENCODER
        .encode_to_string(&metrics::REGISTRY.gather())
        .unwrap_or_default()
}
