//! Admission-track inference from text surrounding a table.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ratiowatch_core::UNCLASSIFIED_LABEL;
use scraper::ElementRef;
use serde::{Deserialize, Serialize};

/// How many preceding sibling elements contribute to a table's context.
pub const SIBLING_WINDOW: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPattern {
    pub label: String,
    pub category: String,
    pub triggers: Vec<String>,
}

/// Ordered label table. Order is the tie-break: the first declared label whose trigger
/// occurs in the context wins, even when a later label's trigger is longer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPatterns {
    #[serde(default)]
    pub version: u32,
    #[serde(default = "default_unclassified")]
    pub unclassified: String,
    #[serde(default)]
    pub labels: Vec<LabelPattern>,
}

fn default_unclassified() -> String {
    UNCLASSIFIED_LABEL.to_string()
}

impl LabelPatterns {
    pub fn new(labels: Vec<LabelPattern>) -> Self {
        Self {
            version: 1,
            unclassified: default_unclassified(),
            labels,
        }
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn category_of(&self, label: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|p| p.label == label)
            .map(|p| p.category.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ContextClassifier {
    patterns: LabelPatterns,
}

impl ContextClassifier {
    pub fn new(patterns: LabelPatterns) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &LabelPatterns {
        &self.patterns
    }

    pub fn unclassified(&self) -> &str {
        &self.patterns.unclassified
    }

    /// Returns the first declared label with a trigger contained in `context`.
    pub fn classify(&self, context: &str) -> &str {
        self.patterns
            .labels
            .iter()
            .find(|p| p.triggers.iter().any(|t| context.contains(t.as_str())))
            .map(|p| p.label.as_str())
            .unwrap_or(self.patterns.unclassified.as_str())
    }

    pub fn classify_element(&self, element: ElementRef<'_>) -> &str {
        self.classify(&context_text(element))
    }
}

/// Text of up to [`SIBLING_WINDOW`] preceding sibling elements, nearest first, followed by
/// the full text of the immediate parent.
pub fn context_text(element: ElementRef<'_>) -> String {
    let mut context = String::new();
    for sibling in element
        .prev_siblings()
        .filter_map(ElementRef::wrap)
        .take(SIBLING_WINDOW)
    {
        context.push(' ');
        context.extend(sibling.text());
    }
    if let Some(parent) = element.parent().and_then(ElementRef::wrap) {
        context.push(' ');
        context.extend(parent.text());
    }
    context
}
