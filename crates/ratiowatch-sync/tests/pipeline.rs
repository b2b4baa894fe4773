use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use ratiowatch_adapters::{ContextClassifier, LabelPatterns, RowIssueKind};
use ratiowatch_core::{LayoutFamily, NameRule, SessionStatus, SourceProfile};
use ratiowatch_storage::{
    FetchError, FetchedPage, MeasurementQuery, PageArchive, PageFetcher, SessionTracker,
    SnapshotStore, Store,
};
use ratiowatch_sync::{IngestPipeline, RecordingObserver, SourceRegistry};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn label_rules() -> ContextClassifier {
    let patterns = LabelPatterns::from_yaml_path(workspace_root().join("rules/labels.yaml"))
        .expect("labels.yaml");
    ContextClassifier::new(patterns)
}

/// Serves canned pages by source code; unknown codes answer 503.
#[derive(Default)]
struct StubFetcher {
    pages: HashMap<String, String>,
}

impl StubFetcher {
    fn with_page(mut self, code: &str, html: impl Into<String>) -> Self {
        self.pages.insert(code.to_string(), html.into());
        self
    }
}

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch_page(&self, source_code: &str, url: &str) -> Result<FetchedPage, FetchError> {
        match self.pages.get(source_code) {
            Some(html) => Ok(FetchedPage {
                status: 200,
                final_url: url.to_string(),
                fetched_at: Utc::now(),
                body: html.as_bytes().to_vec(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            }),
        }
    }
}

/// Answers every source with the same page and records when each request arrived.
struct TimedFetcher {
    html: &'static str,
    calls: std::sync::Mutex<Vec<Instant>>,
}

#[async_trait]
impl PageFetcher for TimedFetcher {
    async fn fetch_page(&self, _source_code: &str, url: &str) -> Result<FetchedPage, FetchError> {
        self.calls.lock().unwrap().push(Instant::now());
        Ok(FetchedPage {
            status: 200,
            final_url: url.to_string(),
            fetched_at: Utc::now(),
            body: self.html.as_bytes().to_vec(),
        })
    }
}

struct HangingFetcher;

#[async_trait]
impl PageFetcher for HangingFetcher {
    async fn fetch_page(&self, _source_code: &str, _url: &str) -> Result<FetchedPage, FetchError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Err(FetchError::Unavailable("unreachable".into()))
    }
}

fn sw_source() -> SourceProfile {
    SourceProfile {
        code: "CKU".into(),
        display_name: "대구가톨릭대학교".into(),
        url: "https://ratio.example.test/cku".into(),
        layout: LayoutFamily::JinhakPerTable,
        enabled: true,
        target_unit: Some("소프트웨어융합대학".into()),
        target_sub_units: vec!["컴퓨터소프트웨어".into()],
        name_rules: vec![NameRule {
            trigger: "컴퓨터소프트웨어".into(),
            canonical: "컴퓨터소프트웨어학부".into(),
        }],
    }
}

fn collect_all_source() -> SourceProfile {
    SourceProfile {
        code: "YNU".into(),
        display_name: "영남대학교".into(),
        url: "https://ratio.example.test/ynu".into(),
        layout: LayoutFamily::Uway,
        enabled: true,
        target_unit: Some("디지털융합대학".into()),
        target_sub_units: Vec::new(),
        name_rules: Vec::new(),
    }
}

async fn pipeline(
    sources: Vec<SourceProfile>,
    fetcher: impl PageFetcher + 'static,
    observer: Arc<RecordingObserver>,
) -> IngestPipeline {
    let store = Store::open_in_memory().await.expect("store");
    let pipeline = IngestPipeline::new(
        store,
        SourceRegistry::new(sources).expect("registry"),
        label_rules(),
        Arc::new(fetcher),
    )
    .with_observer(observer)
    .with_source_spacing(Duration::ZERO);
    pipeline.prepare().await.expect("prepare");
    pipeline
}

const SW_PAGE: &str = r#"<html><body>
<div><h3>2026 학생부종합 SW전형 경쟁률</h3>
<table>
  <tr><th>대학</th><th>모집단위</th><th>모집인원</th><th>지원인원</th></tr>
  <tr><td>소프트웨어융합대학</td><td>컴퓨터소프트웨어학부(교직)</td><td>40</td><td>55</td></tr>
</table></div>
</body></html>"#;

#[tokio::test]
async fn sw_track_row_becomes_one_measurement() {
    let observer = Arc::new(RecordingObserver::new());
    let fetcher = StubFetcher::default().with_page("CKU", SW_PAGE);
    let pipeline = pipeline(vec![sw_source()], fetcher, observer.clone()).await;

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.sources.len(), 1);
    assert_eq!(summary.sources[0].status, SessionStatus::Completed);
    assert!(!summary.interrupted);

    let rows = SnapshotStore::new(pipeline.store())
        .history(&MeasurementQuery::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.source_code, "CKU");
    assert_eq!(row.unit_name, "소프트웨어융합대학");
    assert_eq!(row.sub_unit_name, "컴퓨터소프트웨어학부");
    assert!(row.sub_unit_is_target);
    assert_eq!(row.label, "학생부종합(SW전형)");
    assert_eq!(row.label_category, "학생부종합");
    assert_eq!((row.capacity, row.applicants), (40, 55));
    assert_eq!(row.ratio, 1.375);
    assert_eq!(Some(row.session_id), summary.sources[0].session_id);

    let session = SessionTracker::new(pipeline.store())
        .get(row.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.records_collected, 1);
    assert!(observer.skipped_rows().is_empty());
}

#[tokio::test]
async fn malformed_row_is_skipped_and_the_rest_persist() {
    let mut rows = String::from("<tr><td>디지털융합대학</td><td>깨진 행</td><td>3</td></tr>");
    for i in 0..9 {
        rows.push_str(&format!(
            "<tr><td>디지털융합대학</td><td>학과{i}</td><td>{}</td><td>{}</td></tr>",
            10 + i,
            20 + i
        ));
    }
    let page = format!("<html><body><table>{rows}</table></body></html>");

    let observer = Arc::new(RecordingObserver::new());
    let fetcher = StubFetcher::default().with_page("YNU", page);
    let pipeline = pipeline(vec![collect_all_source()], fetcher, observer.clone()).await;

    let report = pipeline.run_source("YNU").await.unwrap();
    assert_eq!(report.status, SessionStatus::Completed);
    assert_eq!(report.saved, 9);
    assert_eq!(report.skipped_rows, 1);

    let skipped = observer.skipped_rows();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].row_index, 0);
    assert!(matches!(skipped[0].kind, RowIssueKind::TooFewCells { found: 3, .. }));

    let session_id = report.session_id.unwrap();
    let session = SessionTracker::new(pipeline.store()).get(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.records_collected, 9);
    assert_eq!(
        SnapshotStore::new(pipeline.store()).count_for_session(session_id).await.unwrap(),
        9
    );
    assert_eq!(rows_labelled(&pipeline, "일반전형").await, 9);
}

async fn rows_labelled(pipeline: &IngestPipeline, label: &str) -> usize {
    SnapshotStore::new(pipeline.store())
        .history(&MeasurementQuery {
            label: Some(label.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn fetch_failure_records_one_failed_session_and_no_data() {
    let observer = Arc::new(RecordingObserver::new());
    let pipeline = pipeline(vec![sw_source()], StubFetcher::default(), observer.clone()).await;

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.failed_sources(), 1);

    let sessions = SessionTracker::new(pipeline.store())
        .sessions_for_source("CKU", None)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert_eq!(sessions[0].records_collected, 0);
    assert!(sessions[0].finished_at.is_some());
    let cause = sessions[0].error_message.as_deref().unwrap();
    assert!(cause.contains("503"), "{cause}");

    let counts = pipeline.store().entity_counts().await.unwrap();
    assert_eq!(counts.measurements, 0);
    assert_eq!(counts.units, 0);
    assert_eq!(counts.sub_units, 0);
    assert_eq!(observer.reports()[0].error.as_deref(), Some(cause));
}

#[tokio::test]
async fn hung_fetch_times_out_as_a_failed_session() {
    let observer = Arc::new(RecordingObserver::new());
    let pipeline = pipeline(vec![sw_source()], HangingFetcher, observer)
        .await
        .with_fetch_timeout(Duration::from_millis(50));

    let report = pipeline.run_source("CKU").await.unwrap();
    assert_eq!(report.status, SessionStatus::Failed);
    assert!(report.error.unwrap().contains("no response"));
}

#[tokio::test]
async fn one_failing_source_does_not_stop_the_pass() {
    let root = workspace_root();
    let registry = SourceRegistry::from_yaml_path(root.join("sources.yaml")).unwrap();
    let mut fetcher = StubFetcher::default();
    for code in ["CKU", "DGU", "KMU"] {
        let html = std::fs::read_to_string(root.join("fixtures").join(code).join("page.html")).unwrap();
        fetcher = fetcher.with_page(code, html);
    }

    let observer = Arc::new(RecordingObserver::new());
    let pipeline = pipeline(registry.sources, fetcher, observer.clone()).await;
    let summary = pipeline.run_once().await.unwrap();

    let statuses: Vec<(&str, SessionStatus)> = summary
        .sources
        .iter()
        .map(|r| (r.source_code.as_str(), r.status))
        .collect();
    assert_eq!(
        statuses,
        vec![
            ("CKU", SessionStatus::Completed),
            ("DGU", SessionStatus::Completed),
            ("YNU", SessionStatus::Failed),
            ("KMU", SessionStatus::Completed),
        ]
    );
    assert_eq!(summary.saved(), 5 + 3 + 3);
}

#[tokio::test]
async fn repeated_passes_append_history_without_new_entities() {
    let observer = Arc::new(RecordingObserver::new());
    let fetcher = StubFetcher::default().with_page("CKU", SW_PAGE);
    let pipeline = pipeline(vec![sw_source()], fetcher, observer).await;

    pipeline.run_once().await.unwrap();
    let after_first = pipeline.store().entity_counts().await.unwrap();
    pipeline.run_once().await.unwrap();
    let after_second = pipeline.store().entity_counts().await.unwrap();

    assert_eq!(after_second.units, after_first.units);
    assert_eq!(after_second.sub_units, after_first.sub_units);
    assert_eq!(after_second.labels, after_first.labels);
    assert_eq!(after_second.measurements, 2);
    assert_eq!(after_second.sessions, 2);

    let latest = SnapshotStore::new(pipeline.store()).latest_measurements().await.unwrap();
    assert_eq!(latest.len(), 1);
}

#[tokio::test]
async fn shutdown_before_a_pass_runs_nothing() {
    let observer = Arc::new(RecordingObserver::new());
    let fetcher = StubFetcher::default().with_page("CKU", SW_PAGE);
    let pipeline = pipeline(vec![sw_source()], fetcher, observer).await;
    pipeline.shutdown_signal().trigger();

    let summary = pipeline.run_once().await.unwrap();
    assert!(summary.interrupted);
    assert!(summary.sources.is_empty());
    assert_eq!(pipeline.store().entity_counts().await.unwrap().sessions, 0);
}

#[tokio::test]
async fn fetched_pages_are_archived_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Arc::new(RecordingObserver::new());
    let fetcher = StubFetcher::default().with_page("CKU", SW_PAGE);
    let pipeline = pipeline(vec![sw_source()], fetcher, observer)
        .await
        .with_archive(PageArchive::new(dir.path()));

    pipeline.run_once().await.unwrap();

    let hash = PageArchive::sha256_hex(SW_PAGE.as_bytes());
    let archived: Vec<PathBuf> = walk(dir.path());
    assert_eq!(archived.len(), 1);
    assert!(archived[0].ends_with(format!("CKU/{hash}.html")));
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(walk(&path));
        } else {
            files.push(path);
        }
    }
    files
}

#[tokio::test]
async fn consecutive_sources_are_spaced_apart() {
    let spacing = Duration::from_millis(300);
    let fetcher = Arc::new(TimedFetcher {
        html: SW_PAGE,
        calls: Default::default(),
    });
    let store = Store::open_in_memory().await.unwrap();
    let pipeline = IngestPipeline::new(
        store,
        SourceRegistry::new(vec![sw_source(), collect_all_source()]).unwrap(),
        label_rules(),
        fetcher.clone(),
    )
    .with_source_spacing(spacing);
    pipeline.prepare().await.unwrap();

    let started = Instant::now();
    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.sources.len(), 2);

    let calls = fetcher.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].duration_since(started) < spacing, "first source waited");
    assert!(calls[1].duration_since(calls[0]) >= spacing);
}

#[tokio::test]
async fn session_is_failed_when_completion_cannot_be_written() {
    let observer = Arc::new(RecordingObserver::new());
    let fetcher = StubFetcher::default().with_page("CKU", SW_PAGE);
    let pipeline = pipeline(vec![sw_source()], fetcher, observer).await;
    sqlx::query(
        "CREATE TEMP TRIGGER refuse_completion BEFORE UPDATE ON ingestion_sessions \
         WHEN NEW.status = 'COMPLETED' BEGIN SELECT RAISE(ABORT, 'completion refused'); END",
    )
    .execute(pipeline.store().pool())
    .await
    .unwrap();

    let report = pipeline.run_source("CKU").await.unwrap();
    assert_eq!(report.status, SessionStatus::Failed);

    let sessions = SessionTracker::new(pipeline.store()).all().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert!(sessions[0].finished_at.is_some());
    let cause = sessions[0].error_message.as_deref().unwrap();
    assert!(cause.contains("completion refused"), "{cause}");
}
