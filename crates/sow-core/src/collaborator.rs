//! Collaborator capability contracts
//!
//! Planner, Writer and Reviewer are external capabilities. Their outputs are
//! typed and validated on receipt; invalid output is a
//! [`CollaboratorError::Malformed`] and goes through the stage retry budget.
//! The writer never sees the knowledge capability.

use crate::error::CollaboratorError;
use crate::intake::Intake;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sow_retrieval::{ClauseCandidate, RiskLevel, SectionBlueprint, SectionSpec};
use sow_review::{Draft, DraftSection, Finding, ReviewPolicy};
use std::collections::BTreeMap;

#[cfg(test)]
use mockall::automock;

/// Input to the planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub intake: Intake,
    pub document_type: String,
    /// Section templates for the document type
    pub taxonomy: Vec<SectionSpec>,
    /// Maximum risk per section name
    pub risk_matrix: BTreeMap<String, RiskLevel>,
    /// 1-based attempt number
    pub attempt: u32,
    /// Validation error from the previous attempt, for a constrained re-prompt
    pub feedback: Option<String>,
}

/// Planner output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResponse {
    pub sections: Vec<SectionSpec>,
    #[serde(default)]
    pub validation_rules: Vec<String>,
}

/// Input to the writer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub section: SectionSpec,
    pub blueprint: SectionBlueprint,
    pub style_profile: String,
    pub forbidden_commitments: Vec<String>,
    pub attempt: u32,
}

impl WriteRequest {
    /// Clauses the writer may use
    #[must_use]
    pub fn approved_clauses(&self) -> &[ClauseCandidate] {
        &self.blueprint.clauses
    }
}

/// Input to the reviewer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub draft: Draft,
    pub policy: ReviewPolicy,
    pub blueprints: Vec<SectionBlueprint>,
    /// Clause id to source URI
    pub source_map: BTreeMap<String, String>,
}

/// Produces the section plan
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Planner: Send + Sync {
    /// Plan sections for an intake
    ///
    /// # Errors
    /// `Malformed` on schema violation, `Timeout`/`Unavailable` on transport failure
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse, CollaboratorError>;
}

/// Drafts one clause or technical section from its blueprint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Writer: Send + Sync {
    /// Draft a section, or return a `NEEDS_INPUT` draft
    ///
    /// # Errors
    /// `Malformed` on schema violation, `Timeout`/`Unavailable` on transport failure
    async fn write(&self, request: &WriteRequest) -> Result<DraftSection, CollaboratorError>;
}

/// Adds findings to the deterministic review
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reviewer: Send + Sync {
    /// Review a full draft
    ///
    /// # Errors
    /// `Malformed` on schema violation, `Timeout`/`Unavailable` on transport failure
    async fn review(&self, request: &ReviewRequest) -> Result<Vec<Finding>, CollaboratorError>;
}

/// Planner that returns the document-type taxonomy as the plan
///
/// Sections get the risk ceiling from the request's risk matrix.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaxonomyPlanner;

#[async_trait]
impl Planner for TaxonomyPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse, CollaboratorError> {
        if request.taxonomy.is_empty() {
            return Err(CollaboratorError::Rejected(format!(
                "no taxonomy for document type '{}'",
                request.document_type
            )));
        }
        let sections = request
            .taxonomy
            .iter()
            .cloned()
            .map(|mut spec| {
                if let Some(max) = request.risk_matrix.get(&spec.name) {
                    spec.max_risk = Some(*max);
                }
                spec
            })
            .collect();
        Ok(PlanResponse {
            sections,
            validation_rules: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(taxonomy: Vec<SectionSpec>) -> PlanRequest {
        PlanRequest {
            intake: Intake::new(),
            document_type: "sow".into(),
            taxonomy,
            risk_matrix: BTreeMap::from([("Liability".to_string(), RiskLevel::Medium)]),
            attempt: 1,
            feedback: None,
        }
    }

    #[tokio::test]
    async fn taxonomy_planner_applies_risk_matrix() {
        let out = TaxonomyPlanner
            .plan(&request(vec![SectionSpec::new("Liability", "caps"), SectionSpec::new("Scope", "what")]))
            .await
            .unwrap();
        assert_eq!(out.sections[0].max_risk, Some(RiskLevel::Medium));
        assert_eq!(out.sections[1].max_risk, None);
    }

    #[tokio::test]
    async fn empty_taxonomy_is_rejected() {
        let err = TaxonomyPlanner.plan(&request(vec![])).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected(_)));
    }
}
