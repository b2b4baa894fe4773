//! Progress and diagnostics sink for the ingest pipeline.

use std::sync::{Mutex, PoisonError};

use ratiowatch_adapters::RowIssue;
use ratiowatch_core::SourceProfile;
use ratiowatch_storage::RecordFailure;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::SourceReport;

/// Receives pipeline events. Every method defaults to doing nothing.
pub trait PipelineObserver: Send + Sync {
    fn source_started(&self, _source: &SourceProfile, _session_id: Uuid) {}

    fn row_issue(&self, _source_code: &str, _issue: &RowIssue) {}

    fn record_failed(&self, _source_code: &str, _failure: &RecordFailure) {}

    fn source_finished(&self, _report: &SourceReport) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn source_started(&self, source: &SourceProfile, session_id: Uuid) {
        info!(source_code = %source.code, %session_id, url = %source.url, "source started");
    }

    fn row_issue(&self, source_code: &str, issue: &RowIssue) {
        if issue.skipped() {
            warn!(source_code, issue = %issue.describe(), "row skipped");
        } else {
            debug!(source_code, issue = %issue.describe(), "row degraded");
        }
    }

    fn record_failed(&self, source_code: &str, failure: &RecordFailure) {
        warn!(
            source_code,
            index = failure.index,
            sub_unit = %failure.sub_unit,
            reason = %failure.reason,
            "record not saved"
        );
    }

    fn source_finished(&self, report: &SourceReport) {
        match &report.error {
            Some(cause) => error!(
                source_code = %report.source_code,
                status = %report.status,
                cause = %cause,
                "source failed"
            ),
            None => info!(
                source_code = %report.source_code,
                status = %report.status,
                tables = report.tables_seen,
                drafts = report.drafts,
                saved = report.saved,
                skipped_rows = report.skipped_rows,
                "source finished"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedEvent {
    Started { source_code: String, session_id: Uuid },
    RowIssue { source_code: String, issue: RowIssue },
    RecordFailed { source_code: String, failure: RecordFailure },
    Finished(SourceReport),
}

/// Keeps every event in memory, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn skipped_rows(&self) -> Vec<RowIssue> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ObservedEvent::RowIssue { issue, .. } if issue.skipped() => Some(issue),
                _ => None,
            })
            .collect()
    }

    pub fn reports(&self) -> Vec<SourceReport> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                ObservedEvent::Finished(report) => Some(report),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ObservedEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl PipelineObserver for RecordingObserver {
    fn source_started(&self, source: &SourceProfile, session_id: Uuid) {
        self.push(ObservedEvent::Started {
            source_code: source.code.clone(),
            session_id,
        });
    }

    fn row_issue(&self, source_code: &str, issue: &RowIssue) {
        self.push(ObservedEvent::RowIssue {
            source_code: source_code.to_string(),
            issue: issue.clone(),
        });
    }

    fn record_failed(&self, source_code: &str, failure: &RecordFailure) {
        self.push(ObservedEvent::RecordFailed {
            source_code: source_code.to_string(),
            failure: failure.clone(),
        });
    }

    fn source_finished(&self, report: &SourceReport) {
        self.push(ObservedEvent::Finished(report.clone()));
    }
}
