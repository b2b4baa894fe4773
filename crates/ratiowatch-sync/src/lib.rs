//! Ingestion orchestration: configuration, the per-source pipeline, scheduling, and export.

pub mod export;
pub mod observer;
pub mod pipeline;
pub mod schedule;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ratiowatch_core::{SessionStatus, SourceProfile};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

pub use export::{export_history, ExportManifest, ExportManifestFile};
pub use observer::{ObservedEvent, PipelineObserver, RecordingObserver, TracingObserver};
pub use pipeline::{to_observations, IngestPipeline};
pub use schedule::{run_scheduled, ScheduleGate};

pub const CRATE_NAME: &str = "ratiowatch-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceProfile>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<SourceProfile>) -> Result<Self> {
        let mut seen = HashSet::new();
        for source in &sources {
            if !seen.insert(source.code.as_str()) {
                bail!("source {} is configured more than once", source.code);
            }
        }
        Ok(Self { sources })
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Self::new(registry.sources)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceProfile> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn get(&self, code: &str) -> Option<&SourceProfile> {
        self.sources.iter().find(|s| s.code == code)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    /// Raw pages are archived only when set.
    pub artifacts_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_spacing_secs: u64,
    pub interval_minutes: u64,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ratiowatch.db".to_string(),
            artifacts_dir: None,
            user_agent: "Mozilla/5.0 (compatible; ratiowatch/0.1)".to_string(),
            http_timeout_secs: 30,
            source_spacing_secs: 2,
            interval_minutes: 10,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            user_agent: std::env::var("RATIOWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_u64("RATIOWATCH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            source_spacing_secs: env_u64(
                "RATIOWATCH_SOURCE_SPACING_SECS",
                defaults.source_spacing_secs,
            ),
            interval_minutes: env_u64("RATIOWATCH_INTERVAL_MINUTES", defaults.interval_minutes),
            workspace_root: std::env::var("RATIOWATCH_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn labels_path(&self) -> PathBuf {
        self.workspace_root.join("rules").join("labels.yaml")
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn source_spacing(&self) -> Duration {
        Duration::from_secs(self.source_spacing_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1) * 60)
    }
}

/// Cooperative stop request, checked between sources. Clones share one flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`trigger`](Self::trigger) has been called.
    pub async fn triggered(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Outcome of one source within a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source_code: String,
    /// `None` when no session could be opened.
    pub session_id: Option<Uuid>,
    pub status: SessionStatus,
    pub tables_seen: usize,
    pub drafts: usize,
    pub skipped_rows: usize,
    pub saved: usize,
    pub unresolved: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl SourceReport {
    pub(crate) fn new(source_code: &str, session_id: Option<Uuid>) -> Self {
        Self {
            source_code: source_code.to_string(),
            session_id,
            status: SessionStatus::Running,
            tables_seen: 0,
            drafts: 0,
            skipped_rows: 0,
            saved: 0,
            unresolved: 0,
            failed: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    /// Shutdown stopped the pass before every enabled source ran.
    pub interrupted: bool,
}

impl RunSummary {
    pub fn saved(&self) -> usize {
        self.sources.iter().map(|s| s.saved).sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| s.status == SessionStatus::Failed)
            .count()
    }
}

/// Keeps the first line of an error chain and caps its length for the session record.
pub fn short_cause(detail: &str) -> String {
    const MAX_CHARS: usize = 200;
    let line = detail.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= MAX_CHARS {
        line.to_string()
    } else {
        let mut cut: String = line.chars().take(MAX_CHARS).collect();
        cut.push('…');
        cut
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = IngestPipeline::from_config(&config).await?;
    pipeline.run_once().await
}
