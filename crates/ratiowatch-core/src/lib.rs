//! Core domain model for admission-competition snapshots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ratiowatch-core";

/// Label assigned when no track trigger matches the surrounding context.
pub const UNCLASSIFIED_LABEL: &str = "일반전형";

/// Category given to labels first seen on a page rather than declared in the rules file.
pub const UNCATEGORIZED: &str = "미분류";

/// Sub-unit text marking a row that reports a whole unit's combined intake.
pub const COMBINED_INTAKE_MARKER: &str = "단과대학통합모집";

/// Page-layout family shared by a group of sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutFamily {
    /// Each table's track label comes from the text around that table.
    JinhakPerTable,
    /// One track label for the whole page, taken from the page text.
    JinhakPerPage,
    /// No track split on the page; every row gets the unclassified label.
    Uway,
}

impl LayoutFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JinhakPerTable => "jinhak_per_table",
            Self::JinhakPerPage => "jinhak_per_page",
            Self::Uway => "uway",
        }
    }
}

/// `(substring trigger -> canonical name)` pair, applied in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRule {
    pub trigger: String,
    pub canonical: String,
}

/// Static per-source configuration, loaded once from the source registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProfile {
    pub code: String,
    pub display_name: String,
    pub url: String,
    pub layout: LayoutFamily,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub target_unit: Option<String>,
    /// Empty means "collect every sub-unit under the target unit".
    #[serde(default)]
    pub target_sub_units: Vec<String>,
    #[serde(default)]
    pub name_rules: Vec<NameRule>,
}

fn default_enabled() -> bool {
    true
}

/// Adapter output handed to the persistence side of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftRecord {
    pub source_code: String,
    pub unit_name: String,
    pub sub_unit_raw: String,
    pub label: String,
    pub capacity_raw: String,
    pub applicants_raw: String,
    /// True when the row matched a configured sub-unit trigger (or the source collects all).
    pub matched_target: bool,
    pub table_index: usize,
    pub row_index: usize,
}

/// A draft after name canonicalization and count extraction, ready for identity resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub source_code: String,
    pub unit_name: String,
    pub sub_unit_name: String,
    pub label: String,
    pub is_target: bool,
    pub capacity: u32,
    pub applicants: u32,
}

impl Observation {
    pub fn ratio(&self) -> f64 {
        competition_ratio(self.capacity, self.applicants)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubUnitId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub i64);

/// Resolved identity of one measurement series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityTuple {
    pub source: SourceId,
    pub unit: UnitId,
    pub sub_unit: SubUnitId,
    pub label: LabelId,
}

/// `applicants / capacity`, or 0.0 when nothing was offered.
pub fn competition_ratio(capacity: u32, applicants: u32) -> f64 {
    if capacity > 0 {
        f64::from(applicants) / f64::from(capacity)
    } else {
        0.0
    }
}

/// One immutable snapshot row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: i64,
    pub identity: IdentityTuple,
    pub capacity: u32,
    pub applicants: u32,
    pub observed_at: DateTime<Utc>,
    pub session_id: Uuid,
}

impl Measurement {
    pub fn ratio(&self) -> f64 {
        competition_ratio(self.capacity, self.applicants)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_final(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Only `RUNNING -> COMPLETED` and `RUNNING -> FAILED` are legal.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Completed) | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown session status {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for SessionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// One fetch-and-persist attempt for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSession {
    pub id: Uuid,
    pub source_code: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub records_collected: u32,
    pub error_message: Option<String>,
}
