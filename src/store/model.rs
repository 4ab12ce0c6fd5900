use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use uuid::Uuid;

/// Why the broadcast went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum FailureCause {
    ConnectionLost,
    EngineUnresponsive,
    ContentFailure,
    NetworkDegraded,
    ManualStop,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::ConnectionLost => "connection-lost",
            FailureCause::EngineUnresponsive => "engine-unresponsive",
            FailureCause::ContentFailure => "content-failure",
            FailureCause::NetworkDegraded => "network-degraded",
            FailureCause::ManualStop => "manual-stop",
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum StreamingStatus {
    Streaming,
    Stopped,
    Starting,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum OverallStatus {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum ScenePurpose {
    Automated,
    Owner,
    Failover,
    TechnicalDifficulties,
}

/// One continuous broadcast attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StreamSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_duration_sec: i64,
    pub downtime_duration_sec: i64,
    pub avg_bitrate_kbps: f64,
    pub avg_dropped_frames_pct: f64,
    pub peak_cpu_pct: f64,
}

impl StreamSession {
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            ended_at: None,
            total_duration_sec: 0,
            downtime_duration_sec: 0,
            avg_bitrate_kbps: 0.0,
            avg_dropped_frames_pct: 0.0,
            peak_cpu_pct: 0.0,
        }
    }

    pub fn is_ongoing(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Refresh the running total from wall clock.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.total_duration_sec = (now - self.started_at).num_seconds().max(0);
    }

    /// Accumulate downtime, never past the total duration.
    pub fn add_downtime(&mut self, seconds: i64) {
        self.downtime_duration_sec =
            (self.downtime_duration_sec + seconds.max(0)).min(self.total_duration_sec);
    }

    pub fn uptime_duration_sec(&self) -> i64 {
        self.total_duration_sec - self.downtime_duration_sec
    }

    pub fn uptime_pct(&self) -> f64 {
        if self.total_duration_sec == 0 {
            return 100.0;
        }
        (self.uptime_duration_sec() as f64 / self.total_duration_sec as f64) * 100.0
    }
}

/// One fault-to-recovery interval. Never deleted; the uptime audit needs it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DowntimeEvent {
    pub id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_sec: f64,
    pub cause: FailureCause,
    pub recovery_action: String,
    pub automatic_recovery: bool,
    pub requires_operator: bool,
}

impl DowntimeEvent {
    pub fn open(session_id: &str, cause: FailureCause, action: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            duration_sec: 0.0,
            cause,
            recovery_action: action.to_string(),
            automatic_recovery: true,
            requires_operator: false,
        }
    }

    pub fn is_ongoing(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn close(&mut self, final_action: &str) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.duration_sec = (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.recovery_action = format!("{} -> {}", self.recovery_action, final_action);
    }
}

/// One health sample. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetric {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub bitrate_kbps: f64,
    pub dropped_frames_pct: f64,
    pub cpu_pct: f64,
    pub active_scene: String,
    pub connection_status: ConnectionStatus,
    pub streaming_status: StreamingStatus,
}

impl HealthMetric {
    pub fn is_degraded(&self) -> bool {
        self.dropped_frames_pct > 1.0
    }

    pub fn is_healthy(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
            && self.streaming_status == StreamingStatus::Streaming
            && !self.is_degraded()
    }
}

/// One operator takeover of the broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct OwnerSession {
    pub id: String,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_sec: i64,
    pub content_interrupted: Option<String>,
    pub resume_content: Option<String>,
    pub transition_time_sec: f64,
}

impl OwnerSession {
    pub fn open(session_id: &str, interrupted: Option<String>, transition_time_sec: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            duration_sec: 0,
            content_interrupted: interrupted,
            resume_content: None,
            transition_time_sec,
        }
    }

    pub fn is_ongoing(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn close(&mut self, resume_content: Option<String>) {
        let now = Utc::now();
        self.duration_sec = (now - self.started_at).num_seconds().max(0);
        self.ended_at = Some(now);
        self.resume_content = resume_content;
    }
}

/// Outcome of one preflight attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct InitializationState {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub engine_reachable: bool,
    pub scenes_exist: bool,
    pub fallback_content_available: bool,
    pub credentials_configured: bool,
    pub network_reachable: bool,
    pub overall_status: OverallStatus,
    pub stream_started_at: Option<DateTime<Utc>>,
    pub failure_details: Option<String>,
}

impl InitializationState {
    pub fn all_passed(&self) -> bool {
        self.engine_reachable
            && self.scenes_exist
            && self.fallback_content_available
            && self.credentials_configured
            && self.network_reachable
    }
}

/// Required-scene bookkeeping, re-verified during operation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SceneConfig {
    pub name: String,
    pub purpose: ScenePurpose,
    pub exists_on_engine: bool,
    pub last_verified_at: DateTime<Utc>,
}
