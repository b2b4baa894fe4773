//! Site adapter contracts and the shared HTML extraction pieces behind them.

pub mod canonical;
pub mod context;
pub mod layouts;
pub mod table;

use ratiowatch_core::{DraftRecord, LayoutFamily, SourceProfile};
use thiserror::Error;

pub use canonical::{clean_name, NameCanonicalizer};
pub use context::{context_text, ContextClassifier, LabelPattern, LabelPatterns};
pub use layouts::{extract_count, JinhakPageAdapter, JinhakTableAdapter, UwayAdapter};
pub use table::{TableExtractor, TableGroup};

pub const CRATE_NAME: &str = "ratiowatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {0}")]
    Selector(String),
    #[error("source {source_code} uses layout {actual:?}, adapter handles {expected:?}")]
    LayoutMismatch {
        source_code: String,
        expected: LayoutFamily,
        actual: LayoutFamily,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowIssueKind {
    /// The row was skipped.
    TooFewCells { found: usize, required: usize },
    /// The row was kept and the count degraded to zero.
    NoDigits { column: &'static str, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIssue {
    pub table_index: usize,
    pub row_index: usize,
    pub kind: RowIssueKind,
}

impl RowIssue {
    pub fn skipped(&self) -> bool {
        matches!(self.kind, RowIssueKind::TooFewCells { .. })
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            RowIssueKind::TooFewCells { found, required } => format!(
                "table {} row {}: {found} cells, need {required}",
                self.table_index, self.row_index
            ),
            RowIssueKind::NoDigits { column, text } => format!(
                "table {} row {}: {column} {text:?} has no digits, counted as 0",
                self.table_index, self.row_index
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterOutput {
    pub tables_seen: usize,
    pub drafts: Vec<DraftRecord>,
    pub issues: Vec<RowIssue>,
}

impl AdapterOutput {
    pub fn skipped_rows(&self) -> usize {
        self.issues.iter().filter(|i| i.skipped()).count()
    }
}

/// Maps one layout family's raw page onto draft records.
pub trait SiteAdapter: Send + Sync {
    fn layout(&self) -> LayoutFamily;

    fn extract(
        &self,
        page: &str,
        source: &SourceProfile,
        classifier: &ContextClassifier,
    ) -> Result<AdapterOutput, AdapterError>;
}

pub fn adapter_for_layout(layout: LayoutFamily) -> Result<Box<dyn SiteAdapter>, AdapterError> {
    Ok(match layout {
        LayoutFamily::JinhakPerTable => Box::new(JinhakTableAdapter::new()?),
        LayoutFamily::JinhakPerPage => Box::new(JinhakPageAdapter::new()?),
        LayoutFamily::Uway => Box::new(UwayAdapter::new()?),
    })
}
