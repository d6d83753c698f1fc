//! Review policy
//!
//! Pure data, loadable from pipeline configuration. The validator compiles
//! it once; an invalid numeric pattern is reported at that point.

use serde::{Deserialize, Serialize};
use sow_retrieval::RiskLevel;
use std::collections::BTreeMap;

/// A labelled figure tracked across sections
///
/// `pattern` is a regex with one capture group holding the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericKey {
    pub key: String,
    pub pattern: String,
}

impl NumericKey {
    #[must_use]
    pub fn new(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pattern: pattern.into(),
        }
    }
}

/// A phrase that implies an obligation of a given risk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskTerm {
    pub phrase: String,
    pub risk: RiskLevel,
}

impl RiskTerm {
    #[must_use]
    pub fn new(phrase: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            phrase: phrase.into(),
            risk,
        }
    }
}

/// Review policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewPolicy {
    /// Disallowed everywhere
    pub forbidden_phrases: Vec<String>,
    /// Disallowed per jurisdiction (keys compared case-insensitively)
    pub jurisdiction_forbidden: BTreeMap<String, Vec<String>>,
    /// Absolute-obligation language that must appear verbatim in a source clause
    pub absolute_markers: Vec<String>,
    /// Commitments the writer must never make; passed to the writer as well
    pub forbidden_commitments: Vec<String>,
    /// Figures that must agree across sections
    pub numeric_keys: Vec<NumericKey>,
    /// Phrases implying an obligation risk
    pub risk_terms: Vec<RiskTerm>,
    /// Paragraph texts exempt from grounding (compared trimmed, case-insensitive)
    pub boilerplate: Vec<String>,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            forbidden_phrases: vec!["at the vendor's sole discretion".into(), "no acceptance criteria".into()],
            jurisdiction_forbidden: BTreeMap::from([
                ("EU".to_string(), vec!["waives all statutory rights".to_string()]),
                ("UK".to_string(), vec!["waives all statutory rights".to_string()]),
                ("US".to_string(), vec!["punitive damages are waived".to_string()]),
            ]),
            absolute_markers: vec![
                "guarantee".into(),
                "guaranteed".into(),
                "100%".into(),
                "at all times".into(),
                "will always".into(),
                "unconditionally".into(),
                "in all circumstances".into(),
                "without exception".into(),
            ],
            forbidden_commitments: vec!["unlimited liability".into()],
            numeric_keys: vec![
                NumericKey::new(
                    "availability_percent",
                    r"(?i)(\d{1,3}(?:\.\d+)?)\s*%\s*(?:uptime|availability)",
                ),
                NumericKey::new("payment_days", r"(?i)\bnet[\s-]*(\d{1,3})\b"),
                NumericKey::new(
                    "term_months",
                    r"(?i)\b(\d{1,3})[\s-]*months?\s+(?:initial\s+)?term\b",
                ),
                NumericKey::new(
                    "start_date",
                    r"(?i)\b(?:start|commencement)\s+date\s+(?:of\s+|is\s+)?(\d{4}-\d{2}-\d{2})",
                ),
            ],
            risk_terms: vec![
                RiskTerm::new("unlimited liability", RiskLevel::Critical),
                RiskTerm::new("uncapped", RiskLevel::Critical),
                RiskTerm::new("indemnify", RiskLevel::High),
                RiskTerm::new("liquidated damages", RiskLevel::High),
                RiskTerm::new("penalty", RiskLevel::High),
                RiskTerm::new("service credits", RiskLevel::Medium),
            ],
            boilerplate: Vec::new(),
        }
    }
}

impl ReviewPolicy {
    /// Policy with no rules
    #[must_use]
    pub fn empty() -> Self {
        Self {
            forbidden_phrases: Vec::new(),
            jurisdiction_forbidden: BTreeMap::new(),
            absolute_markers: Vec::new(),
            forbidden_commitments: Vec::new(),
            numeric_keys: Vec::new(),
            risk_terms: Vec::new(),
            boilerplate: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_forbidden_phrase(mut self, phrase: impl Into<String>) -> Self {
        self.forbidden_phrases.push(phrase.into());
        self
    }

    #[must_use]
    pub fn with_jurisdiction_term(mut self, jurisdiction: impl Into<String>, phrase: impl Into<String>) -> Self {
        self.jurisdiction_forbidden
            .entry(jurisdiction.into())
            .or_default()
            .push(phrase.into());
        self
    }

    #[must_use]
    pub fn with_absolute_marker(mut self, marker: impl Into<String>) -> Self {
        self.absolute_markers.push(marker.into());
        self
    }

    #[must_use]
    pub fn with_numeric_key(mut self, key: NumericKey) -> Self {
        self.numeric_keys.push(key);
        self
    }

    #[must_use]
    pub fn with_risk_term(mut self, term: RiskTerm) -> Self {
        self.risk_terms.push(term);
        self
    }

    #[must_use]
    pub fn with_boilerplate(mut self, text: impl Into<String>) -> Self {
        self.boilerplate.push(text.into());
        self
    }

    /// Global plus jurisdiction-scoped disallowed terms
    #[must_use]
    pub fn forbidden_for(&self, jurisdiction: &str) -> Vec<(&str, String)> {
        let mut terms: Vec<(&str, String)> = self
            .forbidden_phrases
            .iter()
            .chain(self.forbidden_commitments.iter())
            .map(|p| (p.as_str(), "forbidden:global".to_string()))
            .collect();
        let jurisdiction = jurisdiction.trim();
        for (scope, phrases) in &self.jurisdiction_forbidden {
            if scope.eq_ignore_ascii_case(jurisdiction) {
                terms.extend(
                    phrases
                        .iter()
                        .map(|p| (p.as_str(), format!("forbidden:{scope}"))),
                );
            }
        }
        terms
    }

    /// Whether a paragraph is exempt boilerplate
    #[must_use]
    pub fn is_boilerplate(&self, text: &str) -> bool {
        let text = text.trim();
        self.boilerplate
            .iter()
            .any(|b| b.trim().eq_ignore_ascii_case(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jurisdiction_terms_are_scoped() {
        let policy = ReviewPolicy::default();
        let eu: Vec<_> = policy.forbidden_for("eu").into_iter().map(|(p, _)| p).collect();
        assert!(eu.contains(&"waives all statutory rights"));
        assert!(eu.contains(&"no acceptance criteria"));

        let apac: Vec<_> = policy.forbidden_for("APAC").into_iter().map(|(p, _)| p).collect();
        assert!(!apac.contains(&"waives all statutory rights"));
    }

    #[test]
    fn default_lists_do_not_overlap() {
        let policy = ReviewPolicy::default();
        for phrase in policy.forbidden_phrases.iter().chain(&policy.forbidden_commitments) {
            assert!(
                !policy.absolute_markers.iter().any(|m| m.eq_ignore_ascii_case(phrase)),
                "{phrase} is both forbidden and an absolute marker"
            );
        }
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let policy: ReviewPolicy = serde_json::from_str(r#"{"boilerplate": ["Confidential."]}"#).unwrap();
        assert!(policy.is_boilerplate("  confidential. "));
        assert!(!policy.absolute_markers.is_empty());
    }
}
