//! Typed stage payloads

use crate::error::PlanError;
use crate::intake::Intake;
use serde::{Deserialize, Serialize};
use sow_artifact::{ArtifactError, ArtifactPayload, Stage};
use sow_retrieval::{FilterValue, SectionBlueprint, SectionRetrieval, SectionSpec};
use sow_review::{Draft, Finding, Severity};
use std::collections::HashSet;

/// PLAN: ordered section specs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub document_type: String,
    pub sections: Vec<SectionSpec>,
    #[serde(default)]
    pub validation_rules: Vec<String>,
}

impl Plan {
    #[must_use]
    pub fn new(document_type: impl Into<String>, sections: Vec<SectionSpec>) -> Self {
        Self {
            document_type: document_type.into(),
            sections,
            validation_rules: Vec::new(),
        }
    }

    /// Resolve `{{intake.<field>}}` filter values against the intake
    #[must_use]
    pub fn resolve(mut self, intake: &Intake) -> Self {
        for section in &mut self.sections {
            section.filters = std::mem::take(&mut section.filters)
                .resolve_templates(|field| intake.lookup(field).map(FilterValue::from));
        }
        self
    }

    /// Schema check
    ///
    /// # Errors
    /// Returns the first violated plan invariant
    pub fn check(&self) -> Result<(), PlanError> {
        if self.sections.is_empty() {
            return Err(PlanError::NoSections);
        }
        let mut seen = HashSet::new();
        for section in &self.sections {
            if !seen.insert(section.name.as_str()) {
                return Err(PlanError::DuplicateSection(section.name.clone()));
            }
            section.validate().map_err(|e| PlanError::InvalidSection {
                section: section.name.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    #[must_use]
    pub fn section(&self, name: &str) -> Option<&SectionSpec> {
        self.sections.iter().find(|s| s.name == name)
    }
}

impl ArtifactPayload for Plan {
    const STAGE: Stage = Stage::Plan;

    fn validate_payload(&self) -> Result<(), ArtifactError> {
        self.check()
            .map_err(|e| ArtifactError::InvariantViolation(e.to_string()))
    }
}

/// RETRIEVAL_SET: per-section candidates and diagnostics, ordered by section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSet {
    pub sections: Vec<SectionRetrieval>,
}

impl RetrievalSet {
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&SectionRetrieval> {
        self.sections.iter().find(|s| s.section == name)
    }
}

impl ArtifactPayload for RetrievalSet {
    const STAGE: Stage = Stage::Retrieve;

    fn validate_payload(&self) -> Result<(), ArtifactError> {
        for section in &self.sections {
            if let Some(bad) = section
                .candidates
                .iter()
                .find(|c| c.text.trim().is_empty() || c.source_uri.trim().is_empty())
            {
                return Err(ArtifactError::InvariantViolation(format!(
                    "candidate '{}' in '{}' lacks text or source",
                    bad.id, section.section
                )));
            }
        }
        Ok(())
    }
}

/// ASSEMBLY_BLUEPRINT: one blueprint per planned section, in plan order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintSet {
    pub sections: Vec<SectionBlueprint>,
}

impl BlueprintSet {
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&SectionBlueprint> {
        self.sections.iter().find(|s| s.section == name)
    }
}

impl ArtifactPayload for BlueprintSet {
    const STAGE: Stage = Stage::Assemble;

    fn validate_payload(&self) -> Result<(), ArtifactError> {
        for blueprint in &self.sections {
            let mut ids = HashSet::new();
            if let Some(dup) = blueprint.entries.iter().find(|e| !ids.insert(e.clause_id.as_str())) {
                return Err(ArtifactError::InvariantViolation(format!(
                    "clause '{}' appears twice in '{}'",
                    dup.clause_id, blueprint.section
                )));
            }
        }
        Ok(())
    }
}

/// DRAFT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftSet {
    pub draft: Draft,
}

impl ArtifactPayload for DraftSet {
    const STAGE: Stage = Stage::Write;
}

/// REVIEW_REPORT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub findings: Vec<Finding>,
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
}

impl ReviewReport {
    #[must_use]
    pub fn from_findings(findings: Vec<Finding>) -> Self {
        let count = |s: Severity| findings.iter().filter(|f| f.severity == s).count();
        Self {
            critical: count(Severity::Critical),
            warning: count(Severity::Warning),
            info: count(Severity::Info),
            findings,
        }
    }

    /// Critical findings
    pub fn critical_findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_critical())
    }
}

impl ArtifactPayload for ReviewReport {
    const STAGE: Stage = Stage::Review;

    fn validate_payload(&self) -> Result<(), ArtifactError> {
        if self.critical != self.critical_findings().count() {
            return Err(ArtifactError::InvariantViolation("critical count mismatch".into()));
        }
        Ok(())
    }
}
