//! One pass over the enabled sources: fetch, extract, canonicalize, persist, finalize.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use ratiowatch_adapters::{
    adapter_for_layout, clean_name, extract_count, ContextClassifier, LabelPatterns,
    NameCanonicalizer,
};
use ratiowatch_core::{DraftRecord, Observation, SessionStatus, SourceProfile};
use ratiowatch_storage::{
    FetchError, HttpClientConfig, HttpFetcher, PageArchive, PageFetcher, SessionTracker,
    SnapshotStore, Store,
};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::observer::{PipelineObserver, TracingObserver};
use crate::{short_cause, RunSummary, ShutdownSignal, SourceRegistry, SourceReport, SyncConfig};

/// Grace added on top of the HTTP client's own timeout before the pass gives up on a fetch.
const FETCH_GRACE: Duration = Duration::from_secs(5);

pub struct IngestPipeline {
    store: Store,
    sessions: SessionTracker,
    snapshots: SnapshotStore,
    registry: SourceRegistry,
    classifier: ContextClassifier,
    fetcher: Arc<dyn PageFetcher>,
    observer: Arc<dyn PipelineObserver>,
    archive: Option<PageArchive>,
    fetch_timeout: Duration,
    source_spacing: Duration,
    shutdown: ShutdownSignal,
}

impl IngestPipeline {
    pub fn new(
        store: Store,
        registry: SourceRegistry,
        classifier: ContextClassifier,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        let defaults = SyncConfig::default();
        Self {
            sessions: SessionTracker::new(&store),
            snapshots: SnapshotStore::new(&store),
            store,
            registry,
            classifier,
            fetcher,
            observer: Arc::new(TracingObserver),
            archive: None,
            fetch_timeout: defaults.http_timeout() + FETCH_GRACE,
            source_spacing: defaults.source_spacing(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Opens the store, registers configured sources and labels, and wires the HTTP fetcher.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::from_yaml_path(config.sources_path())?;
        let patterns = LabelPatterns::from_yaml_path(config.labels_path())?;
        let store = Store::open(&config.database_url)
            .await
            .with_context(|| format!("opening store {}", config.database_url))?;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
        })?;

        let pipeline = Self::new(store, registry, ContextClassifier::new(patterns), Arc::new(fetcher))
            .with_fetch_timeout(config.http_timeout() + FETCH_GRACE)
            .with_source_spacing(config.source_spacing());
        let pipeline = match &config.artifacts_dir {
            Some(dir) => pipeline.with_archive(PageArchive::new(dir)),
            None => pipeline,
        };
        pipeline.prepare().await?;
        Ok(pipeline)
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_source_spacing(mut self, spacing: Duration) -> Self {
        self.source_spacing = spacing;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Registers every configured source and seeds the declared labels.
    pub async fn prepare(&self) -> Result<()> {
        self.store
            .register_sources(&self.registry.sources)
            .await
            .context("registering sources")?;
        let labels = self
            .classifier
            .patterns()
            .labels
            .iter()
            .map(|p| (p.label.as_str(), p.category.as_str()));
        self.store.seed_labels(labels).await.context("seeding labels")?;
        Ok(())
    }

    /// Ingests every enabled source in registry order, spaced apart.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ingest_pass", %run_id);

        let (sources, interrupted) = async {
            let mut reports = Vec::new();
            let mut interrupted = false;
            for (position, source) in self.registry.enabled().enumerate() {
                if self.shutdown.is_triggered() {
                    interrupted = true;
                    info!(next = %source.code, "shutdown requested; stopping pass");
                    break;
                }
                if position > 0 && !self.source_spacing.is_zero() {
                    tokio::time::sleep(self.source_spacing).await;
                }
                reports.push(self.ingest_source(source).await);
            }
            (reports, interrupted)
        }
        .instrument(span)
        .await;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources,
            interrupted,
        };
        info!(
            %run_id,
            sources = summary.sources.len(),
            saved = summary.saved(),
            failed_sources = summary.failed_sources(),
            interrupted,
            "pass finished"
        );
        Ok(summary)
    }

    /// Ingests one configured source by code, whether or not it is enabled.
    pub async fn run_source(&self, code: &str) -> Result<SourceReport> {
        let source = self
            .registry
            .get(code)
            .ok_or_else(|| anyhow!("source {code} is not configured"))?;
        Ok(self.ingest_source(source).await)
    }

    /// Never returns an error: failures end up in the report and the session record.
    pub async fn ingest_source(&self, source: &SourceProfile) -> SourceReport {
        let span = info_span!("ingest_source", source_code = %source.code);
        let report = self.ingest_source_inner(source).instrument(span).await;
        self.observer.source_finished(&report);
        report
    }

    async fn ingest_source_inner(&self, source: &SourceProfile) -> SourceReport {
        let session_id = match self.sessions.begin(&source.code).await {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "could not open session");
                let mut report = SourceReport::new(&source.code, None);
                report.status = SessionStatus::Failed;
                report.error = Some(short_cause(&err.to_string()));
                return report;
            }
        };
        self.observer.source_started(source, session_id);
        let mut report = SourceReport::new(&source.code, Some(session_id));

        let page = match self.fetch(source).await {
            Ok(page) => page,
            Err(err) => return self.fail(report, session_id, &err.to_string()).await,
        };

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.store_page(page.fetched_at, &source.code, &page.body).await {
                warn!(error = %err, "page not archived");
            }
        }

        let output = match adapter_for_layout(source.layout)
            .and_then(|adapter| adapter.extract(&page.text(), source, &self.classifier))
        {
            Ok(output) => output,
            Err(err) => return self.fail(report, session_id, &err.to_string()).await,
        };
        for issue in &output.issues {
            self.observer.row_issue(&source.code, issue);
        }
        report.tables_seen = output.tables_seen;
        report.drafts = output.drafts.len();
        report.skipped_rows = output.skipped_rows();

        let observations = to_observations(source, &output.drafts);
        let outcome = self.snapshots.save_batch(session_id, &observations).await;
        for failure in &outcome.failures {
            self.observer.record_failed(&source.code, failure);
        }
        report.saved = outcome.saved;
        report.unresolved = outcome.unresolved;
        report.failed = outcome.failed;

        let saved = u32::try_from(outcome.saved).unwrap_or(u32::MAX);
        match self.sessions.complete(session_id, saved).await {
            Ok(_) => {
                report.status = SessionStatus::Completed;
                report
            }
            Err(err) => {
                error!(%session_id, error = %err, "could not complete session");
                self.fail(report, session_id, &format!("completing session: {err}"))
                    .await
            }
        }
    }

    async fn fetch(&self, source: &SourceProfile) -> Result<ratiowatch_storage::FetchedPage, FetchError> {
        match tokio::time::timeout(
            self.fetch_timeout,
            self.fetcher.fetch_page(&source.code, &source.url),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                url: source.url.clone(),
                after: self.fetch_timeout,
            }),
        }
    }

    async fn fail(&self, mut report: SourceReport, session_id: Uuid, detail: &str) -> SourceReport {
        let cause = short_cause(detail);
        report.status = SessionStatus::Failed;
        if let Err(err) = self.sessions.fail(session_id, &cause).await {
            error!(%session_id, error = %err, "could not record session failure");
        }
        report.error = Some(cause);
        report
    }
}

/// Applies the source's name rules and count parsing to adapter drafts.
pub fn to_observations(source: &SourceProfile, drafts: &[DraftRecord]) -> Vec<Observation> {
    let names = NameCanonicalizer::for_source(source);
    drafts
        .iter()
        .map(|draft| {
            let unit_name = match clean_name(&draft.unit_name) {
                name if name.is_empty() => source
                    .target_unit
                    .clone()
                    .unwrap_or_else(|| source.display_name.clone()),
                name => name,
            };
            Observation {
                source_code: draft.source_code.clone(),
                unit_name,
                sub_unit_name: names.canonicalize(&draft.sub_unit_raw),
                label: draft.label.clone(),
                is_target: draft.matched_target,
                capacity: extract_count(&draft.capacity_raw),
                applicants: extract_count(&draft.applicants_raw),
            }
        })
        .collect()
}
