//! Ordered, all-or-nothing environment checks. Only a full pass authorizes
//! going live; a failed attempt is logged and the whole set re-runs from
//! scratch after the retry interval.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engine::EngineApi;
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::result::Result;
use crate::store::model::{InitializationState, OverallStatus, SceneConfig};
use crate::store::Store;

pub struct PreflightValidator {
    cfg: Config,
    engine: Arc<dyn EngineApi>,
    store: Store,
}

impl PreflightValidator {
    pub fn new(cfg: Config, engine: Arc<dyn EngineApi>, store: Store) -> Self {
        Self { cfg, engine, store }
    }

    /// Re-run the full check set until it passes. Returns `None` when
    /// shutdown is requested first.
    pub async fn run_until_passed(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<InitializationState> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            info!(attempt, "preflight validation starting");
            let state = self.validate().await;

            if state.overall_status == OverallStatus::Passed {
                info!(attempt, init_id = state.id, "preflight validation passed");
                return Some(state);
            }

            error!(
                attempt,
                init_id = state.id,
                failures = state.failure_details.as_deref().unwrap_or("{}"),
                retry_in_ms = self.cfg.preflight.retry_ms,
                "preflight validation failed"
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.cfg.preflight.retry_ms)) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }

    /// One full check pass. Every attempt appends an `InitializationState`
    /// row, pass or fail.
    pub async fn validate(&self) -> InitializationState {
        let mut failures: BTreeMap<&str, String> = BTreeMap::new();

        let engine_reachable = match self.engine.video_settings().await {
            Ok(canvas) => {
                info!(
                    width = canvas.base_width,
                    height = canvas.base_height,
                    fps = canvas.fps,
                    "engine reachable"
                );
                true
            }
            Err(err) => {
                failures.insert("engine_reachable", err.to_string());
                false
            }
        };

        let scenes_exist = if engine_reachable {
            match ensure_scenes(&self.cfg, self.engine.as_ref(), &self.store).await {
                Ok(()) => {
                    self.provision_sources().await;
                    true
                }
                Err(err) => {
                    failures.insert("scenes_exist", err.to_string());
                    false
                }
            }
        } else {
            failures.insert("scenes_exist", "engine not reachable".to_string());
            false
        };

        let fallback_content_available = match self.check_fallback_content().await {
            Ok(()) => true,
            Err(detail) => {
                failures.insert("fallback_content", detail);
                false
            }
        };

        let credentials_configured = !self.cfg.destination.stream_key.trim().is_empty();
        if !credentials_configured {
            failures.insert(
                "credentials",
                "destination stream key is not configured".to_string(),
            );
        }

        let network_reachable = match self.check_network().await {
            Ok(()) => true,
            Err(detail) => {
                failures.insert("network", detail);
                false
            }
        };

        let all_passed = failures.is_empty();
        let state = InitializationState {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            engine_reachable,
            scenes_exist,
            fallback_content_available,
            credentials_configured,
            network_reachable,
            overall_status: if all_passed {
                OverallStatus::Passed
            } else {
                OverallStatus::Failed
            },
            stream_started_at: all_passed.then(Utc::now),
            failure_details: if all_passed {
                None
            } else {
                serde_json::to_string(&failures).ok()
            },
        };

        if let Err(err) = state.db_insert(self.store.pool()).await {
            warn!(%err, "failed to record preflight attempt");
        }
        state
    }

    async fn check_fallback_content(&self) -> std::result::Result<(), String> {
        let path = &self.cfg.content.fallback_file;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|err| format!("{}: {}", path.display(), err))?;
        if !meta.is_file() {
            return Err(format!("{} is not a file", path.display()));
        }
        if meta.len() == 0 {
            return Err(format!("{} is empty", path.display()));
        }
        Ok(())
    }

    async fn check_network(&self) -> std::result::Result<(), String> {
        let addr = &self.cfg.destination.probe_addr;
        let timeout = Duration::from_millis(self.cfg.preflight.probe_timeout_ms);
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(format!("{}: {}", addr, err)),
            Err(_) => Err(format!("{}: connect timed out", addr)),
        }
    }

    /// Point the scene sources at their content. Create-or-update: an
    /// existing source keeps its scene placement and only has its settings
    /// refreshed, so repeated preflights never clobber operator layouts.
    async fn provision_sources(&self) {
        let scenes = &self.cfg.scenes;
        let fallback_file = self.cfg.content.fallback_file.display().to_string();

        let sources = [
            (
                scenes.fallback_source.as_str(),
                json!({ "localFile": fallback_file, "looping": true }),
                Some(true),
            ),
            (
                scenes.content_source.as_str(),
                json!({ "localFile": fallback_file, "looping": true }),
                Some(true),
            ),
            (
                scenes.standby_source.as_str(),
                json!({ "text": "Going live soon" }),
                Some(false),
            ),
            (scenes.attribution_source.as_str(), json!({ "text": "" }), None),
        ];

        for (source, settings, enabled) in sources {
            if let Err(err) = self.engine.set_source_settings(source, settings).await {
                warn!(source, %err, "source provisioning failed");
                continue;
            }
            if let Some(enabled) = enabled {
                if let Err(err) = self.engine.set_source_enabled(source, enabled).await {
                    warn!(source, enabled, %err, "source enable state not applied");
                }
            }
        }
    }
}

/// Create the required scenes that are missing — never touching ones that
/// exist — and refresh their bookkeeping rows. Also used by the supervisor's
/// periodic re-verification tick.
pub async fn ensure_scenes(
    cfg: &Config,
    engine: &dyn EngineApi,
    store: &Store,
) -> Result<()> {
    let existing = engine.list_scenes().await?;
    for (name, purpose) in cfg.required_scenes() {
        let exists = existing.iter().any(|scene| scene == name);
        if !exists {
            engine.create_scene(name).await?;
            info!(scene = name, "created missing scene");
        }
        let record = SceneConfig {
            name: name.to_string(),
            purpose,
            exists_on_engine: true,
            last_verified_at: Utc::now(),
        };
        record.db_upsert(store.pool()).await?;
    }
    Ok(())
}
