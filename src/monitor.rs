//! Observation-only health sampling on a fixed cadence.
//!
//! Writes one `HealthMetric` per tick and classifies what it sees: a soft
//! quality warning for dropped frames, a hard `PossibleFailure` when the
//! engine has answered nothing for the unresponsive window. Scene state is
//! never mutated here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engine::EngineApi;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::event::SupervisorEvent;
use crate::fault::Fault;
use crate::store::model::{ConnectionStatus, HealthMetric, StreamingStatus};
use crate::store::Store;

pub struct HealthMonitor {
    cfg: Config,
    engine: Arc<dyn EngineApi>,
    store: Store,
    events: broadcast::Sender<SupervisorEvent>,
}

struct Throughput {
    bytes_sent: u64,
    duration_ms: u64,
}

impl HealthMonitor {
    pub fn new(
        cfg: Config,
        engine: Arc<dyn EngineApi>,
        store: Store,
        events: broadcast::Sender<SupervisorEvent>,
    ) -> Self {
        Self {
            cfg,
            engine,
            store,
            events,
        }
    }

    pub async fn run(&self, session_id: String, mut shutdown: watch::Receiver<bool>) {
        let tick = Duration::from_millis(self.cfg.monitor.sample_tick.0);
        let unresponsive_after = Duration::from_millis(self.cfg.monitor.unresponsive_after_ms);
        let mut last_ok = Instant::now();
        let mut previous: Option<Throughput> = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => break,
            }

            let metric = self.sample(&session_id, &mut last_ok, &mut previous).await;

            if metric.dropped_frames_pct > self.cfg.monitor.degraded_dropped_pct {
                warn!(
                    dropped_frames_pct = metric.dropped_frames_pct,
                    threshold_pct = self.cfg.monitor.degraded_dropped_pct,
                    scene = metric.active_scene,
                    "stream quality degraded"
                );
                let _ = self.events.send(SupervisorEvent::QualityDegraded {
                    dropped_frames_pct: metric.dropped_frames_pct,
                });
            }

            if metric.streaming_status == StreamingStatus::Streaming
                && metric.connection_status == ConnectionStatus::Connected
            {
                // Lets the failover manager confirm and close open events.
                let _ = self.events.send(SupervisorEvent::Recovered);
            }

            if let Err(err) = metric.db_insert(self.store.pool()).await {
                warn!(%err, "health metric write failed");
            }

            if last_ok.elapsed() > unresponsive_after {
                error!(
                    silent_ms = last_ok.elapsed().as_millis() as u64,
                    "no engine response within the unresponsive window"
                );
                let _ = self
                    .events
                    .send(SupervisorEvent::PossibleFailure(Fault::Engine {
                        detail: format!(
                            "no control response for {} ms",
                            last_ok.elapsed().as_millis()
                        ),
                    }));
                // Re-arm so the signal repeats once per window, not per tick.
                last_ok = Instant::now();
            }
        }
    }

    async fn sample(
        &self,
        session_id: &str,
        last_ok: &mut Instant,
        previous: &mut Option<Throughput>,
    ) -> HealthMetric {
        let status = match self.engine.stream_status().await {
            Ok(status) => status,
            Err(err) => {
                warn!(%err, "health sample failed, recording disconnected state");
                return HealthMetric {
                    id: Uuid::new_v4().to_string(),
                    session_id: session_id.to_string(),
                    timestamp: Utc::now(),
                    bitrate_kbps: 0.0,
                    dropped_frames_pct: 0.0,
                    cpu_pct: 0.0,
                    active_scene: "unknown".to_string(),
                    connection_status: ConnectionStatus::Disconnected,
                    streaming_status: StreamingStatus::Stopped,
                };
            }
        };
        *last_ok = Instant::now();

        let stats = self.engine.stats().await.unwrap_or_default();
        let active_scene = self
            .engine
            .active_scene()
            .await
            .unwrap_or_else(|_| "unknown".to_string());

        let connection_status = if !status.active {
            ConnectionStatus::Disconnected
        } else if status.reconnecting {
            ConnectionStatus::Degraded
        } else {
            ConnectionStatus::Connected
        };
        let streaming_status = if status.active {
            StreamingStatus::Streaming
        } else {
            StreamingStatus::Stopped
        };

        // bits per millisecond is exactly kbit/s.
        let bitrate_kbps = match previous {
            Some(prev) if status.duration_ms > prev.duration_ms => {
                ((status.bytes_sent.saturating_sub(prev.bytes_sent)) * 8) as f64
                    / (status.duration_ms - prev.duration_ms) as f64
            }
            _ if status.duration_ms > 0 => {
                (status.bytes_sent * 8) as f64 / status.duration_ms as f64
            }
            _ => 0.0,
        };
        *previous = Some(Throughput {
            bytes_sent: status.bytes_sent,
            duration_ms: status.duration_ms,
        });

        let dropped_frames_pct = if stats.total_frames > 0 {
            (stats.skipped_frames as f64 / stats.total_frames as f64) * 100.0
        } else {
            0.0
        };

        HealthMetric {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            bitrate_kbps,
            dropped_frames_pct: dropped_frames_pct.clamp(0.0, 100.0),
            cpu_pct: stats.cpu_pct.clamp(0.0, 100.0),
            active_scene,
            connection_status,
            streaming_status,
        }
    }
}
