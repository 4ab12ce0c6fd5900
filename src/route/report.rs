//! Uptime audit over a configurable window: total percentage, per-cause
//! breakdown, and the downtime event list.

use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::result::Result;
use crate::route::AppState;
use crate::store::model::DowntimeEvent;

const UPTIME_TARGET_PCT: f64 = 99.9;

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    #[serde(default = "default_window_days")]
    pub window_days: i64,
}

fn default_window_days() -> i64 {
    7
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub timestamp: DateTime<Utc>,
    pub duration_sec: f64,
    pub cause: String,
    pub recovery_action: String,
    pub automatic_recovery: bool,
    pub requires_operator: bool,
    pub ongoing: bool,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CauseBreakdown {
    pub count: u64,
    pub total_sec: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UptimeReport {
    pub window_days: i64,
    pub total_uptime_seconds: i64,
    pub total_downtime_seconds: i64,
    pub uptime_percentage: f64,
    pub meets_target: bool,
    pub by_cause: BTreeMap<String, CauseBreakdown>,
    pub events: Vec<EventSummary>,
}

pub async fn uptime(
    Query(query): Query<ReportQuery>,
    State(state): State<AppState>,
) -> Result<Json<UptimeReport>> {
    let window_days = query.window_days.clamp(1, 365);
    let now = Utc::now();
    let since = now - chrono::Duration::days(window_days);
    let window_seconds = (now - since).num_seconds();

    let events = DowntimeEvent::db_find_since(state.store.pool(), since).await?;

    let mut by_cause: BTreeMap<String, CauseBreakdown> = BTreeMap::new();
    let mut downtime_seconds = 0.0f64;
    let mut summaries = Vec::with_capacity(events.len());

    for event in events {
        // An event still open counts as downtime up to this instant.
        let duration_sec = if event.ended_at.is_some() {
            event.duration_sec
        } else {
            (now - event.started_at).num_milliseconds().max(0) as f64 / 1000.0
        };
        downtime_seconds += duration_sec;

        let entry = by_cause.entry(event.cause.to_string()).or_default();
        entry.count += 1;
        entry.total_sec += duration_sec;

        summaries.push(EventSummary {
            timestamp: event.started_at,
            duration_sec,
            cause: event.cause.to_string(),
            recovery_action: event.recovery_action,
            automatic_recovery: event.automatic_recovery,
            requires_operator: event.requires_operator,
            ongoing: event.ended_at.is_none(),
        });
    }

    let downtime_seconds = downtime_seconds.min(window_seconds as f64);
    let uptime_seconds = window_seconds as f64 - downtime_seconds;
    let uptime_percentage = if window_seconds > 0 {
        (uptime_seconds / window_seconds as f64) * 100.0
    } else {
        100.0
    };

    Ok(Json(UptimeReport {
        window_days,
        total_uptime_seconds: uptime_seconds as i64,
        total_downtime_seconds: downtime_seconds as i64,
        uptime_percentage,
        meets_target: uptime_percentage >= UPTIME_TARGET_PCT,
        by_cause,
        events: summaries,
    }))
}
