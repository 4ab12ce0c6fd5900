use std::time::Duration;
use std::{env, fs, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub scenes: Scenes,
    #[serde(default)]
    pub content: Content,
    #[serde(default)]
    pub owner: Owner,
    #[serde(default)]
    pub monitor: Monitor,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub failover: Failover,
    #[serde(default)]
    pub preflight: Preflight,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Http {
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Broadcast engine control socket.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Engine {
    #[serde(default = "default_engine_addr")]
    pub addr: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub call_timeout: CallTimeoutMillis,
    #[serde(default)]
    pub reconnect: Reconnect,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Reconnect {
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_reconnect_jitter")]
    pub jitter: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Destination {
    /// Stream key for the broadcast destination. Never logged.
    #[serde(default = "default_stream_key")]
    pub stream_key: String,
    /// host:port probed during preflight to confirm outbound reachability.
    #[serde(default = "default_probe_addr")]
    pub probe_addr: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scenes {
    #[serde(default = "default_scene_automated")]
    pub automated: String,
    #[serde(default = "default_scene_owner")]
    pub owner: String,
    #[serde(default = "default_scene_fallback")]
    pub fallback: String,
    #[serde(default = "default_scene_technical")]
    pub technical_difficulties: String,
    /// Media source inside the automated scene playing scheduled items.
    #[serde(default = "default_content_source")]
    pub content_source: String,
    /// Media source inside the fallback scene looping the fallback file.
    #[serde(default = "default_fallback_source")]
    pub fallback_source: String,
    /// Text source shown while the owner's signal is not yet live.
    #[serde(default = "default_standby_source")]
    pub standby_source: String,
    /// Text source carrying now-playing attribution.
    #[serde(default = "default_attribution_source")]
    pub attribution_source: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Content {
    #[serde(default = "default_fallback_file")]
    pub fallback_file: PathBuf,
    /// Directory the library provider draws scheduled items from.
    #[serde(default)]
    pub library_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Owner {
    /// Engine sources whose activation means the operator wants the air.
    #[serde(default = "default_owner_sources")]
    pub sources: Vec<String>,
    #[serde(default)]
    pub poll_tick: OwnerPollTick,
    #[serde(default = "default_owner_debounce_ms")]
    pub debounce_ms: u64,
    /// How long to wait for a properly-live signal before showing standby.
    #[serde(default = "default_owner_live_timeout_ms")]
    pub live_timeout_ms: u64,
    #[serde(default = "default_owner_switch_budget_ms")]
    pub switch_budget_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Monitor {
    #[serde(default)]
    pub sample_tick: SampleTick,
    #[serde(default = "default_degraded_dropped_pct")]
    pub degraded_dropped_pct: f64,
    #[serde(default = "default_unresponsive_after_ms")]
    pub unresponsive_after_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Session {
    #[serde(default)]
    pub status_tick: StatusTick,
    #[serde(default = "default_session_reconnect_ms")]
    pub reconnect_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Failover {
    #[serde(default = "default_failover_budget_ms")]
    pub switch_budget_ms: u64,
    #[serde(default = "default_max_engine_restarts")]
    pub max_engine_restarts: u32,
    /// Command handed to the process-lifecycle collaborator to restart the
    /// engine, e.g. "systemctl restart obs".
    #[serde(default)]
    pub restart_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Preflight {
    #[serde(default = "default_preflight_retry_ms")]
    pub retry_ms: u64,
    #[serde(default = "default_preflight_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_purge_tick_ms")]
    pub purge_tick_ms: u64,
    #[serde(default = "default_reverify_tick_ms")]
    pub reverify_tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTimeoutMillis(pub u64);

impl Default for CallTimeoutMillis {
    fn default() -> Self {
        CallTimeoutMillis(5000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerPollTick(pub u64);

impl Default for OwnerPollTick {
    fn default() -> Self {
        OwnerPollTick(1000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleTick(pub u64);

impl Default for SampleTick {
    fn default() -> Self {
        SampleTick(10_000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTick(pub u64);

impl Default for StatusTick {
    fn default() -> Self {
        StatusTick(30_000)
    }
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from_str(&format!(
        "127.0.0.1:{}",
        env::var("PORT").unwrap_or(String::from("8000"))
    ))
    .expect("invalid listen address")
}

impl Default for Http {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            cors: Default::default(),
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

fn default_engine_addr() -> String {
    env::var("LIVEWARD_ENGINE_ADDR").unwrap_or(String::from("127.0.0.1:4455"))
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            addr: default_engine_addr(),
            token: None,
            call_timeout: Default::default(),
            reconnect: Default::default(),
        }
    }
}

fn default_reconnect_initial_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_jitter() -> f64 {
    0.2
}

impl Default for Reconnect {
    fn default() -> Self {
        Self {
            initial_ms: default_reconnect_initial_ms(),
            max_ms: default_reconnect_max_ms(),
            jitter: default_reconnect_jitter(),
        }
    }
}

fn default_stream_key() -> String {
    env::var("LIVEWARD_STREAM_KEY").unwrap_or_default()
}

fn default_probe_addr() -> String {
    String::from("live-video.twitch.tv:1935")
}

impl Default for Destination {
    fn default() -> Self {
        Self {
            stream_key: default_stream_key(),
            probe_addr: default_probe_addr(),
        }
    }
}

fn default_scene_automated() -> String {
    String::from("Automated Content")
}

fn default_scene_owner() -> String {
    String::from("Owner Live")
}

fn default_scene_fallback() -> String {
    String::from("Failover")
}

fn default_scene_technical() -> String {
    String::from("Technical Difficulties")
}

fn default_content_source() -> String {
    String::from("Content Player")
}

fn default_fallback_source() -> String {
    String::from("Fallback Video")
}

fn default_standby_source() -> String {
    String::from("Standby Overlay")
}

fn default_attribution_source() -> String {
    String::from("Content Attribution")
}

impl Default for Scenes {
    fn default() -> Self {
        Self {
            automated: default_scene_automated(),
            owner: default_scene_owner(),
            fallback: default_scene_fallback(),
            technical_difficulties: default_scene_technical(),
            content_source: default_content_source(),
            fallback_source: default_fallback_source(),
            standby_source: default_standby_source(),
            attribution_source: default_attribution_source(),
        }
    }
}

fn default_fallback_file() -> PathBuf {
    PathBuf::from("content/fallback/default.mp4")
}

impl Default for Content {
    fn default() -> Self {
        Self {
            fallback_file: default_fallback_file(),
            library_dir: None,
        }
    }
}

fn default_owner_sources() -> Vec<String> {
    vec![String::from("Owner Camera"), String::from("Owner Screen")]
}

fn default_owner_debounce_ms() -> u64 {
    5000
}

fn default_owner_live_timeout_ms() -> u64 {
    30_000
}

fn default_owner_switch_budget_ms() -> u64 {
    10_000
}

impl Default for Owner {
    fn default() -> Self {
        Self {
            sources: default_owner_sources(),
            poll_tick: Default::default(),
            debounce_ms: default_owner_debounce_ms(),
            live_timeout_ms: default_owner_live_timeout_ms(),
            switch_budget_ms: default_owner_switch_budget_ms(),
        }
    }
}

fn default_degraded_dropped_pct() -> f64 {
    1.0
}

fn default_unresponsive_after_ms() -> u64 {
    30_000
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            sample_tick: Default::default(),
            degraded_dropped_pct: default_degraded_dropped_pct(),
            unresponsive_after_ms: default_unresponsive_after_ms(),
        }
    }
}

fn default_session_reconnect_ms() -> u64 {
    10_000
}

impl Default for Session {
    fn default() -> Self {
        Self {
            status_tick: Default::default(),
            reconnect_ms: default_session_reconnect_ms(),
        }
    }
}

fn default_failover_budget_ms() -> u64 {
    5000
}

fn default_max_engine_restarts() -> u32 {
    3
}

impl Default for Failover {
    fn default() -> Self {
        Self {
            switch_budget_ms: default_failover_budget_ms(),
            max_engine_restarts: default_max_engine_restarts(),
            restart_command: None,
        }
    }
}

fn default_preflight_retry_ms() -> u64 {
    60_000
}

fn default_preflight_probe_timeout_ms() -> u64 {
    5000
}

impl Default for Preflight {
    fn default() -> Self {
        Self {
            retry_ms: default_preflight_retry_ms(),
            probe_timeout_ms: default_preflight_probe_timeout_ms(),
        }
    }
}

fn default_database() -> String {
    env::var("LIVEWARD_DATABASE").unwrap_or(String::from("sqlite://liveward.db"))
}

fn default_retention_days() -> u32 {
    7
}

fn default_purge_tick_ms() -> u64 {
    3_600_000
}

fn default_reverify_tick_ms() -> u64 {
    60_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            retention_days: default_retention_days(),
            purge_tick_ms: default_purge_tick_ms(),
            reverify_tick_ms: default_reverify_tick_ms(),
        }
    }
}

impl Config {
    pub fn parse(path: Option<String>) -> Self {
        let result = fs::read_to_string(path.unwrap_or(String::from("liveward.toml")))
            .or(fs::read_to_string("/etc/liveward/liveward.toml"))
            .unwrap_or("".to_string());
        let cfg: Self = toml::from_str(result.as_str()).expect("config parse error");
        match cfg.validate() {
            Ok(_) => cfg,
            Err(err) => panic!("config validate [{}]", err),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.owner.sources.is_empty() {
            return Err(anyhow::anyhow!("owner.sources cannot be empty"));
        }
        if self.owner.debounce_ms < self.owner.poll_tick.0 {
            return Err(anyhow::anyhow!(
                "owner.debounce_ms must be at least one poll tick"
            ));
        }
        if !(0.0..=1.0).contains(&self.engine.reconnect.jitter) {
            return Err(anyhow::anyhow!("engine.reconnect.jitter must be in [0, 1]"));
        }
        Ok(())
    }

    pub fn required_scenes(&self) -> [(&str, crate::store::model::ScenePurpose); 4] {
        use crate::store::model::ScenePurpose;
        [
            (self.scenes.automated.as_str(), ScenePurpose::Automated),
            (self.scenes.owner.as_str(), ScenePurpose::Owner),
            (self.scenes.fallback.as_str(), ScenePurpose::Failover),
            (
                self.scenes.technical_difficulties.as_str(),
                ScenePurpose::TechnicalDifficulties,
            ),
        ]
    }

    pub fn channel_config(&self) -> engine::ChannelConfig {
        engine::ChannelConfig {
            addr: self.engine.addr.clone(),
            token: self.engine.token.clone(),
            call_timeout: Duration::from_millis(self.engine.call_timeout.0),
            backoff: engine::Backoff::new(
                Duration::from_millis(self.engine.reconnect.initial_ms),
                Duration::from_millis(self.engine.reconnect.max_ms),
                self.engine.reconnect.jitter,
            ),
        }
    }
}
