//! Durable record store for sessions, downtime events, health metrics,
//! owner sessions and preflight attempts.
//!
//! Writes are serialized through a single sqlite connection; every state
//! transition in the supervisor lands here so a process restart can
//! reconstruct what was live by querying instead of remembering.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::result::Result;

mod db;
pub mod model;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS stream_sessions (
        id TEXT PRIMARY KEY,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        total_duration_sec INTEGER NOT NULL DEFAULT 0,
        downtime_duration_sec INTEGER NOT NULL DEFAULT 0,
        avg_bitrate_kbps REAL NOT NULL DEFAULT 0,
        avg_dropped_frames_pct REAL NOT NULL DEFAULT 0,
        peak_cpu_pct REAL NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS downtime_events (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        duration_sec REAL NOT NULL DEFAULT 0,
        cause TEXT NOT NULL,
        recovery_action TEXT NOT NULL,
        automatic_recovery INTEGER NOT NULL DEFAULT 1,
        requires_operator INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS health_metrics (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        bitrate_kbps REAL NOT NULL,
        dropped_frames_pct REAL NOT NULL,
        cpu_pct REAL NOT NULL,
        active_scene TEXT NOT NULL,
        connection_status TEXT NOT NULL,
        streaming_status TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS owner_sessions (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        started_at TEXT NOT NULL,
        ended_at TEXT,
        duration_sec INTEGER NOT NULL DEFAULT 0,
        content_interrupted TEXT,
        resume_content TEXT,
        transition_time_sec REAL NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS init_states (
        id TEXT PRIMARY KEY,
        timestamp TEXT NOT NULL,
        engine_reachable INTEGER NOT NULL,
        scenes_exist INTEGER NOT NULL,
        fallback_content_available INTEGER NOT NULL,
        credentials_configured INTEGER NOT NULL,
        network_reachable INTEGER NOT NULL,
        overall_status TEXT NOT NULL,
        stream_started_at TEXT,
        failure_details TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scene_configs (
        name TEXT PRIMARY KEY,
        purpose TEXT NOT NULL,
        exists_on_engine INTEGER NOT NULL DEFAULT 0,
        last_verified_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_metrics_session ON health_metrics (session_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_events_session ON downtime_events (session_id, started_at)",
    "CREATE INDEX IF NOT EXISTS idx_owner_session ON owner_sessions (session_id, started_at)",
];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // One connection: per-entity writes are serialized by design.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
