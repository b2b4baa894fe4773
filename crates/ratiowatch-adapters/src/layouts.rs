//! Layout-family adapters sharing one row-selection engine.

use ratiowatch_core::{DraftRecord, LayoutFamily, SourceProfile, COMBINED_INTAKE_MARKER};
use scraper::Html;
use tracing::debug;

use crate::context::ContextClassifier;
use crate::table::{TableExtractor, TableGroup};
use crate::{AdapterError, AdapterOutput, RowIssue, RowIssueKind, SiteAdapter};

/// Unit, sub-unit, capacity and applicants are read from the first four cells.
pub const MIN_CELLS: usize = 4;

const UNIT_CELL: usize = 0;
const SUB_UNIT_CELL: usize = 1;
const CAPACITY_CELL: usize = 2;
const APPLICANTS_CELL: usize = 3;

/// First run of ASCII digits after dropping thousands separators; 0 when there is none.
pub fn extract_count(text: &str) -> u32 {
    text.replace(',', "")
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .fold(0u32, |acc, c| {
            acc.saturating_mul(10)
                .saturating_add(c.to_digit(10).unwrap_or(0))
        })
}

pub fn has_digits(text: &str) -> bool {
    text.chars().any(|c| c.is_ascii_digit())
}

/// Why a row passed the source's selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// The sub-unit text contains one of the configured triggers.
    Target,
    /// The row reports a unit-wide combined intake.
    CombinedIntake,
    /// The source has no sub-unit filter.
    CollectAll,
}

impl Selection {
    pub fn is_target(self) -> bool {
        !matches!(self, Self::CombinedIntake)
    }
}

pub fn select_row(source: &SourceProfile, unit_cell: &str, sub_unit_cell: &str) -> Option<Selection> {
    let unit_matches = source
        .target_unit
        .as_deref()
        .map_or(true, |unit| unit_cell.contains(unit));
    if !unit_matches {
        return None;
    }
    if source.target_sub_units.is_empty() {
        return Some(Selection::CollectAll);
    }
    if source
        .target_sub_units
        .iter()
        .any(|trigger| sub_unit_cell.contains(trigger.as_str()))
    {
        return Some(Selection::Target);
    }
    if sub_unit_cell.contains(COMBINED_INTAKE_MARKER) {
        return Some(Selection::CombinedIntake);
    }
    None
}

fn collect_drafts<'a>(
    tables: impl Iterator<Item = TableGroup<'a>>,
    source: &SourceProfile,
    mut label_for: impl FnMut(&TableGroup<'a>) -> String,
) -> AdapterOutput {
    let mut output = AdapterOutput::default();

    for group in tables {
        output.tables_seen += 1;
        let mut table_label: Option<String> = None;

        for (row_index, cells) in group.rows.iter().enumerate() {
            if cells.is_empty() {
                continue;
            }
            if cells.len() < MIN_CELLS {
                output.issues.push(RowIssue {
                    table_index: group.index,
                    row_index,
                    kind: RowIssueKind::TooFewCells {
                        found: cells.len(),
                        required: MIN_CELLS,
                    },
                });
                continue;
            }

            let Some(selection) = select_row(source, &cells[UNIT_CELL], &cells[SUB_UNIT_CELL]) else {
                continue;
            };

            for (column, text) in [
                ("capacity", &cells[CAPACITY_CELL]),
                ("applicants", &cells[APPLICANTS_CELL]),
            ] {
                if !has_digits(text) {
                    output.issues.push(RowIssue {
                        table_index: group.index,
                        row_index,
                        kind: RowIssueKind::NoDigits {
                            column,
                            text: text.clone(),
                        },
                    });
                }
            }

            let label = table_label.get_or_insert_with(|| label_for(&group)).clone();
            output.drafts.push(DraftRecord {
                source_code: source.code.clone(),
                unit_name: cells[UNIT_CELL].clone(),
                sub_unit_raw: cells[SUB_UNIT_CELL].clone(),
                label,
                capacity_raw: cells[CAPACITY_CELL].clone(),
                applicants_raw: cells[APPLICANTS_CELL].clone(),
                matched_target: selection.is_target(),
                table_index: group.index,
                row_index,
            });
        }
    }

    output
}

fn ensure_layout(adapter: &dyn SiteAdapter, source: &SourceProfile) -> Result<(), AdapterError> {
    if source.layout != adapter.layout() {
        return Err(AdapterError::LayoutMismatch {
            source_code: source.code.clone(),
            expected: adapter.layout(),
            actual: source.layout,
        });
    }
    Ok(())
}

fn log_output(source: &SourceProfile, output: &AdapterOutput) {
    debug!(
        source = %source.code,
        layout = source.layout.as_str(),
        tables = output.tables_seen,
        drafts = output.drafts.len(),
        issues = output.issues.len(),
        "extracted page"
    );
}

/// Pages where every table sits under its own track heading.
#[derive(Debug, Clone)]
pub struct JinhakTableAdapter {
    tables: TableExtractor,
}

impl JinhakTableAdapter {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            tables: TableExtractor::new()?,
        })
    }
}

impl SiteAdapter for JinhakTableAdapter {
    fn layout(&self) -> LayoutFamily {
        LayoutFamily::JinhakPerTable
    }

    fn extract(
        &self,
        page: &str,
        source: &SourceProfile,
        classifier: &ContextClassifier,
    ) -> Result<AdapterOutput, AdapterError> {
        ensure_layout(self, source)?;
        let document = Html::parse_document(page);
        let output = collect_drafts(self.tables.tables(&document), source, |group| {
            classifier.classify_element(group.element).to_string()
        });
        log_output(source, &output);
        Ok(output)
    }
}

/// Pages that publish a single track; the label is read from the page text once.
#[derive(Debug, Clone)]
pub struct JinhakPageAdapter {
    tables: TableExtractor,
}

impl JinhakPageAdapter {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            tables: TableExtractor::new()?,
        })
    }
}

impl SiteAdapter for JinhakPageAdapter {
    fn layout(&self) -> LayoutFamily {
        LayoutFamily::JinhakPerPage
    }

    fn extract(
        &self,
        page: &str,
        source: &SourceProfile,
        classifier: &ContextClassifier,
    ) -> Result<AdapterOutput, AdapterError> {
        ensure_layout(self, source)?;
        let document = Html::parse_document(page);
        let page_text: String = document.root_element().text().collect();
        let label = classifier.classify(&page_text).to_string();
        let output = collect_drafts(self.tables.tables(&document), source, |_| label.clone());
        log_output(source, &output);
        Ok(output)
    }
}

/// Pages without a track split; every row carries the unclassified label.
#[derive(Debug, Clone)]
pub struct UwayAdapter {
    tables: TableExtractor,
}

impl UwayAdapter {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            tables: TableExtractor::new()?,
        })
    }
}

impl SiteAdapter for UwayAdapter {
    fn layout(&self) -> LayoutFamily {
        LayoutFamily::Uway
    }

    fn extract(
        &self,
        page: &str,
        source: &SourceProfile,
        classifier: &ContextClassifier,
    ) -> Result<AdapterOutput, AdapterError> {
        ensure_layout(self, source)?;
        let document = Html::parse_document(page);
        let label = classifier.unclassified().to_string();
        let output = collect_drafts(self.tables.tables(&document), source, |_| label.clone());
        log_output(source, &output);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{LabelPattern, LabelPatterns};
    use ratiowatch_core::{NameRule, UNCLASSIFIED_LABEL};

    fn classifier() -> ContextClassifier {
        ContextClassifier::new(LabelPatterns::new(vec![
            LabelPattern {
                label: "학생부교과(교과전형)".into(),
                category: "학생부교과".into(),
                triggers: vec!["교과전형".into()],
            },
            LabelPattern {
                label: "학생부종합(SW전형)".into(),
                category: "학생부종합".into(),
                triggers: vec!["SW전형".into()],
            },
        ]))
    }

    fn source(layout: LayoutFamily, unit: Option<&str>, subs: &[&str]) -> SourceProfile {
        SourceProfile {
            code: "CKU".into(),
            display_name: "대구가톨릭대학교".into(),
            url: "https://example.invalid/ratio.html".into(),
            layout,
            enabled: true,
            target_unit: unit.map(str::to_string),
            target_sub_units: subs.iter().map(|s| s.to_string()).collect(),
            name_rules: vec![NameRule {
                trigger: "컴퓨터소프트웨어".into(),
                canonical: "컴퓨터소프트웨어학부".into(),
            }],
        }
    }

    #[test]
    fn count_extraction_tolerates_noise() {
        assert_eq!(extract_count("1,234명"), 1234);
        assert_eq!(extract_count("없음"), 0);
        assert_eq!(extract_count(""), 0);
        assert_eq!(extract_count("약 12 : 1"), 12);
        assert_eq!(extract_count("99999999999999"), u32::MAX);
    }

    #[test]
    fn selection_requires_unit_and_sub_unit_match() {
        let src = source(LayoutFamily::JinhakPerTable, Some("소프트웨어융합대학"), &["컴퓨터소프트웨어"]);
        assert_eq!(
            select_row(&src, "소프트웨어융합대학", "컴퓨터소프트웨어학부"),
            Some(Selection::Target)
        );
        assert_eq!(select_row(&src, "공과대학", "컴퓨터소프트웨어학부"), None);
        assert_eq!(select_row(&src, "소프트웨어융합대학", "경영학과"), None);
        assert_eq!(
            select_row(&src, "소프트웨어융합대학", "[단과대학통합모집]"),
            Some(Selection::CombinedIntake)
        );
    }

    #[test]
    fn empty_sub_unit_filter_collects_everything_under_unit() {
        let src = source(LayoutFamily::Uway, Some("디지털융합대학"), &[]);
        assert_eq!(select_row(&src, "디지털융합대학", "아무학과"), Some(Selection::CollectAll));
        assert_eq!(select_row(&src, "공과대학", "아무학과"), None);
    }

    #[test]
    fn missing_unit_filter_matches_any_unit() {
        let src = source(LayoutFamily::Uway, None, &["게임소프트웨어"]);
        assert_eq!(select_row(&src, "어느대학", "게임소프트웨어학과"), Some(Selection::Target));
        assert!(Selection::Target.is_target());
        assert!(Selection::CollectAll.is_target());
        assert!(!Selection::CombinedIntake.is_target());
    }

    #[test]
    fn per_table_adapter_labels_each_table_from_its_context() {
        let page = r#"<html><body>
        <div><h3>교과전형</h3><table>
          <tr><th>대학</th><th>모집단위</th><th>모집</th><th>지원</th><th>경쟁률</th></tr>
          <tr><td>소프트웨어융합대학</td><td>컴퓨터소프트웨어학부</td><td>30</td><td>90</td><td>3.00</td></tr>
        </table></div>
        <div><h3>SW전형</h3><table>
          <tr><td>소프트웨어융합대학</td><td>컴퓨터소프트웨어학부(교직)</td><td>40</td><td>55</td><td>1.38</td></tr>
          <tr><td>소프트웨어융합대학</td><td>경영학과</td><td>40</td><td>55</td><td>1.38</td></tr>
        </table></div>
        </body></html>"#;
        let src = source(LayoutFamily::JinhakPerTable, Some("소프트웨어융합대학"), &["컴퓨터소프트웨어"]);
        let adapter = JinhakTableAdapter::new().unwrap();
        let output = adapter.extract(page, &src, &classifier()).unwrap();

        assert_eq!(output.tables_seen, 2);
        let labels: Vec<&str> = output.drafts.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, vec!["학생부교과(교과전형)", "학생부종합(SW전형)"]);
        assert_eq!(output.drafts[1].sub_unit_raw, "컴퓨터소프트웨어학부(교직)");
        assert_eq!(output.drafts[1].capacity_raw, "40");
        assert_eq!(output.drafts[1].applicants_raw, "55");
        assert!(output.issues.is_empty());
    }

    #[test]
    fn short_rows_are_reported_and_skipped() {
        let page = r#"<div><h3>SW전형</h3><table>
          <tr><td>소프트웨어융합대학</td><td>컴퓨터소프트웨어학부</td></tr>
          <tr><td>소프트웨어융합대학</td><td>컴퓨터소프트웨어학부</td><td>없음</td><td>3</td></tr>
        </table></div>"#;
        let src = source(LayoutFamily::JinhakPerTable, Some("소프트웨어융합대학"), &["컴퓨터소프트웨어"]);
        let adapter = JinhakTableAdapter::new().unwrap();
        let output = adapter.extract(page, &src, &classifier()).unwrap();

        assert_eq!(output.drafts.len(), 1);
        assert_eq!(output.skipped_rows(), 1);
        assert!(output.issues.iter().any(|i| matches!(
            i.kind,
            RowIssueKind::TooFewCells { found: 2, required: MIN_CELLS }
        )));
        assert!(output.issues.iter().any(|i| matches!(
            &i.kind,
            RowIssueKind::NoDigits { column: "capacity", text } if text == "없음"
        )));
    }

    #[test]
    fn per_page_adapter_uses_one_label_for_all_tables() {
        let page = r#"<html><body><h1>2026 수시 SW전형 경쟁률</h1>
          <table><tr><td>IT·공과대학</td><td>컴퓨터정보공학부</td><td>20</td><td>41</td></tr></table>
          <table><tr><td>IT·공과대학</td><td>컴퓨터정보공학부 사이버보안전공</td><td>10</td><td>12</td></tr></table>
        </body></html>"#;
        let mut src = source(LayoutFamily::JinhakPerPage, Some("IT·공과대학"), &["컴퓨터정보공학부"]);
        src.code = "DGU".into();
        let adapter = JinhakPageAdapter::new().unwrap();
        let output = adapter.extract(page, &src, &classifier()).unwrap();

        assert_eq!(output.drafts.len(), 2);
        assert!(output.drafts.iter().all(|d| d.label == "학생부종합(SW전형)"));
        assert!(output.drafts.iter().all(|d| d.source_code == "DGU"));
    }

    #[test]
    fn uway_adapter_never_classifies() {
        let page = r#"<h3>교과전형</h3><table>
          <tr><td>디지털융합대학</td><td>융합전자공학과</td><td>25</td><td>100</td><td>4.00</td></tr>
        </table>"#;
        let src = source(LayoutFamily::Uway, Some("디지털융합대학"), &[]);
        let adapter = UwayAdapter::new().unwrap();
        let output = adapter.extract(page, &src, &classifier()).unwrap();

        assert_eq!(output.drafts.len(), 1);
        assert_eq!(output.drafts[0].label, UNCLASSIFIED_LABEL);
        assert!(output.drafts[0].matched_target);
    }

    #[test]
    fn adapter_rejects_source_of_another_layout() {
        let src = source(LayoutFamily::Uway, None, &[]);
        let adapter = JinhakTableAdapter::new().unwrap();
        let err = adapter.extract("<table></table>", &src, &classifier()).unwrap_err();
        assert!(matches!(err, AdapterError::LayoutMismatch { .. }));
    }
}
