use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::AppError;
use crate::result::Result;
use crate::store::model::{
    DowntimeEvent, HealthMetric, InitializationState, OwnerSession, SceneConfig, StreamSession,
};

impl StreamSession {
    pub async fn db_insert(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO stream_sessions
            (id, started_at, ended_at, total_duration_sec, downtime_duration_sec,
             avg_bitrate_kbps, avg_dropped_frames_pct, peak_cpu_pct)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(self.id.clone())
        .bind(self.started_at)
        .bind(self.ended_at)
        .bind(self.total_duration_sec)
        .bind(self.downtime_duration_sec)
        .bind(self.avg_bitrate_kbps)
        .bind(self.avg_dropped_frames_pct)
        .bind(self.peak_cpu_pct)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn db_update(&self, pool: &SqlitePool) -> Result<()> {
        let rows_affected = sqlx::query(
            r#"UPDATE stream_sessions SET
            ended_at = ?, total_duration_sec = ?, downtime_duration_sec = ?,
            avg_bitrate_kbps = ?, avg_dropped_frames_pct = ?, peak_cpu_pct = ?
            WHERE id = ?"#,
        )
        .bind(self.ended_at)
        .bind(self.total_duration_sec)
        .bind(self.downtime_duration_sec)
        .bind(self.avg_bitrate_kbps)
        .bind(self.avg_dropped_frames_pct)
        .bind(self.peak_cpu_pct)
        .bind(self.id.clone())
        .execute(pool)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(AppError::not_found(format!("stream session {}", self.id)));
        }
        Ok(())
    }

    pub async fn db_find_open(pool: &SqlitePool) -> Result<Option<StreamSession>> {
        let session: Option<StreamSession> = sqlx::query_as(
            "SELECT * FROM stream_sessions WHERE ended_at IS NULL ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_optional(pool)
        .await?;
        Ok(session)
    }

    pub async fn db_find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<StreamSession>> {
        let session: Option<StreamSession> =
            sqlx::query_as("SELECT * FROM stream_sessions WHERE id = ?")
                .bind(id)
                .fetch_optional(pool)
                .await?;
        Ok(session)
    }
}

impl DowntimeEvent {
    pub async fn db_insert(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO downtime_events
            (id, session_id, started_at, ended_at, duration_sec, cause,
             recovery_action, automatic_recovery, requires_operator)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(self.id.clone())
        .bind(self.session_id.clone())
        .bind(self.started_at)
        .bind(self.ended_at)
        .bind(self.duration_sec)
        .bind(self.cause)
        .bind(self.recovery_action.clone())
        .bind(self.automatic_recovery)
        .bind(self.requires_operator)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn db_update(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"UPDATE downtime_events SET
            ended_at = ?, duration_sec = ?, recovery_action = ?,
            automatic_recovery = ?, requires_operator = ?
            WHERE id = ?"#,
        )
        .bind(self.ended_at)
        .bind(self.duration_sec)
        .bind(self.recovery_action.clone())
        .bind(self.automatic_recovery)
        .bind(self.requires_operator)
        .bind(self.id.clone())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn db_find_open(pool: &SqlitePool, session_id: &str) -> Result<Option<DowntimeEvent>> {
        let event: Option<DowntimeEvent> = sqlx::query_as(
            r#"SELECT * FROM downtime_events
            WHERE session_id = ? AND ended_at IS NULL
            ORDER BY started_at DESC LIMIT 1"#,
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
        Ok(event)
    }

    pub async fn db_find_by_session(pool: &SqlitePool, session_id: &str) -> Result<Vec<DowntimeEvent>> {
        let events: Vec<DowntimeEvent> =
            sqlx::query_as("SELECT * FROM downtime_events WHERE session_id = ? ORDER BY started_at")
                .bind(session_id)
                .fetch_all(pool)
                .await?;
        Ok(events)
    }

    pub async fn db_find_since(
        pool: &SqlitePool,
        since: DateTime<Utc>,
    ) -> Result<Vec<DowntimeEvent>> {
        let events: Vec<DowntimeEvent> =
            sqlx::query_as("SELECT * FROM downtime_events WHERE started_at >= ? ORDER BY started_at")
                .bind(since)
                .fetch_all(pool)
                .await?;
        Ok(events)
    }

    pub async fn db_last(pool: &SqlitePool, session_id: &str) -> Result<Option<DowntimeEvent>> {
        let event: Option<DowntimeEvent> = sqlx::query_as(
            "SELECT * FROM downtime_events WHERE session_id = ? ORDER BY started_at DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
        Ok(event)
    }

    /// Operator marker for a terminal event; the one path that closes an
    /// event without automatic recovery.
    pub async fn db_resolve_terminal(pool: &SqlitePool, id: &str, note: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            r#"UPDATE downtime_events SET
            ended_at = ?, duration_sec = (julianday(?) - julianday(started_at)) * 86400.0,
            recovery_action = recovery_action || ' -> ' || ?,
            automatic_recovery = 0
            WHERE id = ? AND requires_operator = 1 AND ended_at IS NULL"#,
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(note)
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(AppError::not_found(format!("open terminal event {}", id)));
        }
        Ok(())
    }
}

impl HealthMetric {
    pub async fn db_insert(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO health_metrics
            (id, session_id, timestamp, bitrate_kbps, dropped_frames_pct, cpu_pct,
             active_scene, connection_status, streaming_status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(self.id.clone())
        .bind(self.session_id.clone())
        .bind(self.timestamp)
        .bind(self.bitrate_kbps)
        .bind(self.dropped_frames_pct)
        .bind(self.cpu_pct)
        .bind(self.active_scene.clone())
        .bind(self.connection_status)
        .bind(self.streaming_status)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn db_latest(pool: &SqlitePool, session_id: &str) -> Result<Option<HealthMetric>> {
        let metric: Option<HealthMetric> = sqlx::query_as(
            "SELECT * FROM health_metrics WHERE session_id = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
        Ok(metric)
    }

    /// (avg bitrate, avg dropped frames, peak cpu) across the session.
    pub async fn db_aggregate(pool: &SqlitePool, session_id: &str) -> Result<(f64, f64, f64)> {
        let aggregate: (f64, f64, f64) = sqlx::query_as(
            r#"SELECT
            COALESCE(AVG(bitrate_kbps), 0.0),
            COALESCE(AVG(dropped_frames_pct), 0.0),
            COALESCE(MAX(cpu_pct), 0.0)
            FROM health_metrics WHERE session_id = ?"#,
        )
        .bind(session_id)
        .fetch_one(pool)
        .await?;
        Ok(aggregate)
    }

    pub async fn db_purge_older_than(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
        let rows_affected = sqlx::query("DELETE FROM health_metrics WHERE timestamp < ?")
            .bind(cutoff)
            .execute(pool)
            .await?
            .rows_affected();
        Ok(rows_affected)
    }
}

impl OwnerSession {
    /// Owner sessions for one stream session never overlap; an insert while
    /// another is open is refused.
    pub async fn db_insert(&self, pool: &SqlitePool) -> Result<()> {
        if let Some(open) = OwnerSession::db_find_open(pool, &self.session_id).await? {
            return Err(AppError::conflict(format!(
                "owner session {} is still open",
                open.id
            )));
        }
        sqlx::query(
            r#"INSERT INTO owner_sessions
            (id, session_id, started_at, ended_at, duration_sec,
             content_interrupted, resume_content, transition_time_sec)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(self.id.clone())
        .bind(self.session_id.clone())
        .bind(self.started_at)
        .bind(self.ended_at)
        .bind(self.duration_sec)
        .bind(self.content_interrupted.clone())
        .bind(self.resume_content.clone())
        .bind(self.transition_time_sec)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn db_update(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"UPDATE owner_sessions SET
            ended_at = ?, duration_sec = ?, resume_content = ?, transition_time_sec = ?
            WHERE id = ?"#,
        )
        .bind(self.ended_at)
        .bind(self.duration_sec)
        .bind(self.resume_content.clone())
        .bind(self.transition_time_sec)
        .bind(self.id.clone())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn db_find_open(pool: &SqlitePool, session_id: &str) -> Result<Option<OwnerSession>> {
        let session: Option<OwnerSession> = sqlx::query_as(
            r#"SELECT * FROM owner_sessions
            WHERE session_id = ? AND ended_at IS NULL
            ORDER BY started_at DESC LIMIT 1"#,
        )
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
        Ok(session)
    }

    pub async fn db_find_by_session(pool: &SqlitePool, session_id: &str) -> Result<Vec<OwnerSession>> {
        let sessions: Vec<OwnerSession> =
            sqlx::query_as("SELECT * FROM owner_sessions WHERE session_id = ? ORDER BY started_at")
                .bind(session_id)
                .fetch_all(pool)
                .await?;
        Ok(sessions)
    }
}

impl InitializationState {
    pub async fn db_insert(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO init_states
            (id, timestamp, engine_reachable, scenes_exist, fallback_content_available,
             credentials_configured, network_reachable, overall_status,
             stream_started_at, failure_details)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(self.id.clone())
        .bind(self.timestamp)
        .bind(self.engine_reachable)
        .bind(self.scenes_exist)
        .bind(self.fallback_content_available)
        .bind(self.credentials_configured)
        .bind(self.network_reachable)
        .bind(self.overall_status)
        .bind(self.stream_started_at)
        .bind(self.failure_details.clone())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn db_latest(pool: &SqlitePool) -> Result<Option<InitializationState>> {
        let state: Option<InitializationState> =
            sqlx::query_as("SELECT * FROM init_states ORDER BY timestamp DESC LIMIT 1")
                .fetch_optional(pool)
                .await?;
        Ok(state)
    }
}

impl SceneConfig {
    /// Insert or refresh verification fields. Purpose is set on first insert
    /// and left alone afterwards.
    pub async fn db_upsert(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO scene_configs (name, purpose, exists_on_engine, last_verified_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET exists_on_engine = ?, last_verified_at = ?"#,
        )
        .bind(self.name.clone())
        .bind(self.purpose)
        .bind(self.exists_on_engine)
        .bind(self.last_verified_at)
        .bind(self.exists_on_engine)
        .bind(self.last_verified_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn db_all(pool: &SqlitePool) -> Result<Vec<SceneConfig>> {
        let scenes: Vec<SceneConfig> =
            sqlx::query_as("SELECT * FROM scene_configs ORDER BY name")
                .fetch_all(pool)
                .await?;
        Ok(scenes)
    }
}
