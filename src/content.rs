//! Collaborator seams the supervisor consumes but does not own: the content
//! provider deciding what plays next, and the process-lifecycle hook used to
//! restart an unresponsive engine.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

/// Opaque playable-item descriptor. The supervisor only needs the path, the
/// runtime and pass-through metadata for attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayableItem {
    pub file_path: PathBuf,
    pub duration_sec: Option<f64>,
    pub title: Option<String>,
    pub attribution: Option<String>,
}

impl PlayableItem {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let file_path = path.into();
        let title = file_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
        Self {
            file_path,
            duration_sec: None,
            title,
            attribution: None,
        }
    }

    /// Text pushed into the attribution overlay when this item airs.
    pub fn overlay_text(&self) -> String {
        match (&self.title, &self.attribution) {
            (Some(title), Some(attribution)) => format!("{}\n{}", title, attribution),
            (Some(title), None) => title.clone(),
            (None, Some(attribution)) => attribution.clone(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBlock {
    Morning,
    Daytime,
    Evening,
    Overnight,
}

impl TimeBlock {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            6..=11 => TimeBlock::Morning,
            12..=17 => TimeBlock::Daytime,
            18..=23 => TimeBlock::Evening,
            _ => TimeBlock::Overnight,
        }
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self::from_hour(now.hour())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ItemConstraints {
    pub max_duration_sec: Option<f64>,
}

#[async_trait]
pub trait ContentProvider: Send + Sync {
    async fn next_item(
        &self,
        block: TimeBlock,
        constraints: &ItemConstraints,
    ) -> anyhow::Result<PlayableItem>;
}

/// Provider that always serves the pre-verified fallback item. Used when no
/// content library is configured.
pub struct FallbackProvider {
    item: PlayableItem,
}

impl FallbackProvider {
    pub fn new(fallback_file: &Path) -> Self {
        Self {
            item: PlayableItem::from_path(fallback_file),
        }
    }
}

#[async_trait]
impl ContentProvider for FallbackProvider {
    async fn next_item(
        &self,
        _block: TimeBlock,
        _constraints: &ItemConstraints,
    ) -> anyhow::Result<PlayableItem> {
        Ok(self.item.clone())
    }
}

const PLAYABLE_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mov"];

/// Round-robin provider over a content directory.
pub struct LibraryProvider {
    dir: PathBuf,
    cursor: AtomicUsize,
}

impl LibraryProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cursor: AtomicUsize::new(0),
        }
    }

    fn scan(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| PLAYABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ContentProvider for LibraryProvider {
    async fn next_item(
        &self,
        _block: TimeBlock,
        _constraints: &ItemConstraints,
    ) -> anyhow::Result<PlayableItem> {
        let files = self.scan()?;
        if files.is_empty() {
            return Err(anyhow::anyhow!(
                "no playable items in {}",
                self.dir.display()
            ));
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % files.len();
        Ok(PlayableItem::from_path(&files[index]))
    }
}

#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    async fn restart(&self, target: &str) -> anyhow::Result<()>;
}

/// Restarts the engine by running the configured shell command.
pub struct CommandLifecycle {
    command: Option<String>,
}

impl CommandLifecycle {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl ProcessLifecycle for CommandLifecycle {
    async fn restart(&self, target: &str) -> anyhow::Result<()> {
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no restart command configured for {}", target))?;
        info!(target, command, "restarting engine process");
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            warn!(target, ?status, "engine restart command failed");
            return Err(anyhow::anyhow!("restart command exited with {}", status));
        }
        Ok(())
    }
}
