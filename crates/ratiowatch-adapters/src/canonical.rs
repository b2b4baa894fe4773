//! Sub-unit name canonicalization.

use ratiowatch_core::{NameRule, SourceProfile, COMBINED_INTAKE_MARKER};

/// Administrative suffixes that are replaced by a space before matching.
pub const NOISE_SUBSTRINGS: &[&str] = &["교직", "RIS사업"];

/// Maps raw department text onto a source's controlled vocabulary.
///
/// Never fails: text that matches no rule comes back cleaned but otherwise untouched.
#[derive(Debug, Clone, Copy)]
pub struct NameCanonicalizer<'a> {
    rules: &'a [NameRule],
}

impl<'a> NameCanonicalizer<'a> {
    pub fn new(rules: &'a [NameRule]) -> Self {
        Self { rules }
    }

    pub fn for_source(source: &'a SourceProfile) -> Self {
        Self::new(&source.name_rules)
    }

    pub fn canonicalize(&self, raw: &str) -> String {
        let cleaned = clean_name(raw);
        self.rules
            .iter()
            .find(|rule| cleaned.contains(rule.trigger.as_str()))
            .map(|rule| rule.canonical.clone())
            .unwrap_or(cleaned)
    }
}

/// Drops the bracketed combined-intake marker and noise suffixes, then collapses whitespace.
pub fn clean_name(raw: &str) -> String {
    let mut text = raw.replace(&format!("[{COMBINED_INTAKE_MARKER}]"), "");
    for noise in NOISE_SUBSTRINGS {
        text = text.replace(noise, " ");
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> Vec<NameRule> {
        [
            ("컴퓨터공학전공", "컴퓨터정보공학부(컴퓨터공학전공)"),
            ("컴퓨터소프트웨어전공", "컴퓨터정보공학부(컴퓨터소프트웨어전공)"),
            ("컴퓨터정보공학", "컴퓨터정보공학부"),
        ]
        .into_iter()
        .map(|(trigger, canonical)| NameRule {
            trigger: trigger.to_string(),
            canonical: canonical.to_string(),
        })
        .collect()
    }

    #[test]
    fn strips_noise_and_collapses_whitespace() {
        assert_eq!(clean_name("  AI빅데이터공학과   (RIS사업)  "), "AI빅데이터공학과 ( )");
        assert_eq!(clean_name("[단과대학통합모집]소프트웨어융합대학"), "소프트웨어융합대학");
        assert_eq!(clean_name("수학교육과\t교직"), "수학교육과");
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = rules();
        let names = NameCanonicalizer::new(&rules);
        assert_eq!(
            names.canonicalize("컴퓨터정보공학부 컴퓨터공학전공"),
            "컴퓨터정보공학부(컴퓨터공학전공)"
        );
        assert_eq!(names.canonicalize("컴퓨터정보공학부"), "컴퓨터정보공학부");
    }

    #[test]
    fn unmatched_names_pass_through_cleaned() {
        let rules = rules();
        let names = NameCanonicalizer::new(&rules);
        assert_eq!(names.canonicalize("  기계공학부  "), "기계공학부");
        assert_eq!(names.canonicalize(""), "");
    }

    #[test]
    fn rules_see_cleaned_text() {
        let rules = vec![NameRule {
            trigger: "컴퓨터소프트웨어".to_string(),
            canonical: "컴퓨터소프트웨어학부".to_string(),
        }];
        let names = NameCanonicalizer::new(&rules);
        assert_eq!(names.canonicalize("컴퓨터소프트웨어학부(교직)"), "컴퓨터소프트웨어학부");
    }
}
