//! Live health snapshot. Always reflects current truth, including
//! mid-recovery: what is reported here is exactly what the supervisor
//! believes.

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::result::Result;
use crate::route::AppState;
use crate::session::SessionState;
use crate::store::model::{DowntimeEvent, HealthMetric, StreamSession};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuality {
    pub bitrate_kbps: f64,
    pub dropped_frames_pct: f64,
    pub cpu_pct: f64,
    pub connection_status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastFailover {
    pub timestamp: DateTime<Utc>,
    pub cause: String,
    pub recovery_sec: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub downtime_sec: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub streaming: bool,
    pub uptime_seconds: i64,
    pub uptime_percentage: f64,
    pub current_scene: String,
    pub owner_live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<StreamQuality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failover: Option<LastFailover>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

pub async fn snapshot(State(state): State<AppState>) -> Result<Json<HealthSnapshot>> {
    let status = state.status.borrow().clone();
    let streaming = matches!(*state.session_state.borrow(), SessionState::Live);

    let Some(mut session) = StreamSession::db_find_open(state.store.pool()).await? else {
        let owner_live = status.owner_live();
        return Ok(Json(HealthSnapshot {
            streaming: false,
            uptime_seconds: 0,
            uptime_percentage: 100.0,
            current_scene: status.scene,
            owner_live,
            quality: None,
            last_failover: None,
            session: None,
        }));
    };
    session.touch(Utc::now());

    let quality = HealthMetric::db_latest(state.store.pool(), &session.id)
        .await?
        .map(|metric| StreamQuality {
            bitrate_kbps: metric.bitrate_kbps,
            dropped_frames_pct: metric.dropped_frames_pct,
            cpu_pct: metric.cpu_pct,
            connection_status: serde_variant(&metric.connection_status),
        });

    let last_failover = DowntimeEvent::db_last(state.store.pool(), &session.id)
        .await?
        .map(|event| LastFailover {
            timestamp: event.started_at,
            cause: event.cause.to_string(),
            recovery_sec: event.ended_at.map(|_| event.duration_sec),
        });

    let owner_live = status.owner_live();
    Ok(Json(HealthSnapshot {
        streaming,
        uptime_seconds: session.total_duration_sec,
        uptime_percentage: session.uptime_pct(),
        current_scene: status.scene,
        owner_live,
        quality,
        last_failover,
        session: Some(SessionInfo {
            id: session.id.clone(),
            started_at: session.started_at,
            downtime_sec: session.downtime_duration_sec,
        }),
    }))
}

fn serde_variant<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}
