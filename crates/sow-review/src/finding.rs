//! Review findings

use serde::{Deserialize, Serialize};
use sow_artifact::ContentHash;
use std::fmt;

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// What a finding is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    /// Paragraph maps to no approved clause or intake fact
    UnsupportedStatement,
    /// Absolute obligation not backed verbatim by a source clause
    UnsupportedCommitment,
    /// A figure disagrees across sections
    NumericInconsistency,
    /// Disallowed term for the jurisdiction
    ForbiddenPhrase,
    /// Implied obligations at or over the section's risk ceiling
    RiskPolicy,
    /// Required fields or minimum content missing
    IncompleteSection,
    /// Raised by the reviewer capability
    ReviewerNote,
}

impl FindingCategory {
    /// Snake-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FindingCategory::UnsupportedStatement => "unsupported_statement",
            FindingCategory::UnsupportedCommitment => "unsupported_commitment",
            FindingCategory::NumericInconsistency => "numeric_inconsistency",
            FindingCategory::ForbiddenPhrase => "forbidden_phrase",
            FindingCategory::RiskPolicy => "risk_policy",
            FindingCategory::IncompleteSection => "incomplete_section",
            FindingCategory::ReviewerNote => "reviewer_note",
        }
    }
}

impl fmt::Display for FindingCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a finding points
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub section: String,
    /// 0-based paragraph index; `None` for section-level findings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paragraph: Option<usize>,
}

impl Location {
    #[must_use]
    pub fn section(section: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            paragraph: None,
        }
    }

    #[must_use]
    pub fn paragraph(section: impl Into<String>, paragraph: usize) -> Self {
        Self {
            section: section.into(),
            paragraph: Some(paragraph),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.paragraph {
            Some(p) => write!(f, "{} ¶{}", self.section, p + 1),
            None => f.write_str(&self.section),
        }
    }
}

/// One review finding
///
/// `id` is derived from the finding's content, so re-reviewing an unchanged
/// draft yields the same ids and overrides keep pointing at the same finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub category: FindingCategory,
    pub location: Location,
    /// Policy rule or evidence reference
    pub reference: String,
    /// Matched text, when there is one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    pub remediation: String,
}

impl Finding {
    /// Build a finding; the id is computed from the other fields
    #[must_use]
    pub fn new(
        severity: Severity,
        category: FindingCategory,
        location: Location,
        reference: impl Into<String>,
        remediation: impl Into<String>,
    ) -> Self {
        let mut finding = Self {
            id: String::new(),
            severity,
            category,
            location,
            reference: reference.into(),
            evidence: None,
            remediation: remediation.into(),
        };
        finding.id = finding.compute_id();
        finding
    }

    /// Attach matched text
    #[must_use]
    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self.id = self.compute_id();
        self
    }

    #[inline]
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    fn compute_id(&self) -> String {
        let paragraph = self
            .location
            .paragraph
            .map(|p| p.to_string())
            .unwrap_or_default();
        let hash = ContentHash::of_fields([
            self.category.as_str(),
            self.location.section.as_str(),
            paragraph.as_str(),
            self.reference.as_str(),
            self.evidence.as_deref().unwrap_or(""),
        ]);
        format!("F-{}", hash.short())
    }
}

/// Sort findings: most severe first, then by location, category and id
pub fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.location.cmp(&b.location))
            .then_with(|| a.category.cmp(&b.category))
            .then_with(|| a.id.cmp(&b.id))
    });
}
