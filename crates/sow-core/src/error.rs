//! Error types for the SOW pipeline
//!
//! Covers:
//! - Intake and override validation
//! - Stage preconditions and illegal transitions
//! - Collaborator retry exhaustion
//! - Optimistic-concurrency conflicts on artifact writes
//! - Insufficient retrieval evidence
//!
//! Every error lowers to an [`ErrorReport`] with machine-readable
//! remediation hints.

use crate::case::CaseStage;
use serde::{Deserialize, Serialize};
use sow_artifact::{ArtifactError, CaseId, Stage, StoreError};
use sow_retrieval::{FilterDimension, RetrievalError};
use std::fmt;
use std::time::Duration;

/// Main pipeline error type
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Malformed user input
    #[error("validation failed: {message} ({})", fields.join(", "))]
    Validation { message: String, fields: Vec<String> },

    /// Stage-order or lock precondition not met
    #[error("precondition failed for {stage}: {reason}")]
    Precondition {
        stage: Stage,
        reason: String,
        current: CaseStage,
        artifact_version: Option<u32>,
        /// Offending items (sections, conflicts, finding ids)
        items: Vec<String>,
        hints: Vec<RemediationHint>,
    },

    /// Illegal state transition
    #[error("illegal transition {from} -> {to}")]
    StageViolation { from: CaseStage, to: CaseStage },

    /// External capability exhausted its retry budget
    #[error("{collaborator} failed during {stage} after {attempts} attempt(s): {message}")]
    CollaboratorFailure {
        stage: Stage,
        collaborator: String,
        attempts: u32,
        message: String,
        artifact_version: Option<u32>,
    },

    /// Lost an artifact write race twice
    #[error("concurrent write to {stage} v{version}")]
    ConcurrentVersionConflict { stage: Stage, version: u32 },

    /// Retrieval below the coverage threshold
    #[error("insufficient evidence for {} section(s)", sections.len())]
    InsufficientEvidence {
        sections: Vec<EvidenceShortfall>,
        artifact_version: Option<u32>,
    },

    /// No such case
    #[error("unknown case: {0}")]
    UnknownCase(CaseId),

    /// Case was cancelled
    #[error("case {0} is cancelled")]
    Cancelled(CaseId),

    /// Artifact sealing or decoding failure
    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Store failure other than a version conflict
    #[error("store error: {0}")]
    Store(StoreError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// A section below the evidence threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceShortfall {
    pub section: String,
    pub found: usize,
    pub required: usize,
    /// Dimensions still carried by the last attempt
    pub remaining_filters: Vec<FilterDimension>,
}

/// Error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "PreconditionError")]
    Precondition,
    StageViolation,
    CollaboratorFailure,
    ConcurrentVersionConflict,
    InsufficientEvidence,
    UnknownCase,
    Cancelled,
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Precondition => "PreconditionError",
            ErrorKind::StageViolation => "StageViolation",
            ErrorKind::CollaboratorFailure => "CollaboratorFailure",
            ErrorKind::ConcurrentVersionConflict => "ConcurrentVersionConflict",
            ErrorKind::InsufficientEvidence => "InsufficientEvidence",
            ErrorKind::UnknownCase => "UnknownCase",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable next step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationHint {
    /// e.g. `add_override`, `relax_filters`, `lock_plan`, `fix_field`
    pub action: String,
    pub target: String,
    pub detail: String,
}

impl RemediationHint {
    #[must_use]
    pub fn new(action: impl Into<String>, target: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target: target.into(),
            detail: detail.into(),
        }
    }
}

/// Structured error object returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<CaseStage>,
    #[serde(default)]
    pub hints: Vec<RemediationHint>,
}

impl PipelineError {
    /// Error classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::Config(_) => ErrorKind::Validation,
            Self::Precondition { .. } => ErrorKind::Precondition,
            Self::StageViolation { .. } => ErrorKind::StageViolation,
            Self::CollaboratorFailure { .. } => ErrorKind::CollaboratorFailure,
            Self::ConcurrentVersionConflict { .. } => ErrorKind::ConcurrentVersionConflict,
            Self::InsufficientEvidence { .. } => ErrorKind::InsufficientEvidence,
            Self::UnknownCase(_) => ErrorKind::UnknownCase,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Store(e) if e.is_version_conflict() => ErrorKind::ConcurrentVersionConflict,
            Self::Artifact(_) | Self::Store(_) => ErrorKind::Internal,
        }
    }

    /// Whether re-issuing the same request may succeed
    ///
    /// Only write races qualify; sequencing and validation errors need a
    /// different request.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConcurrentVersionConflict
    }

    /// Precondition failure with no items or hints
    #[must_use]
    pub fn precondition(stage: Stage, current: CaseStage, reason: impl Into<String>) -> Self {
        Self::Precondition {
            stage,
            reason: reason.into(),
            current,
            artifact_version: None,
            items: Vec::new(),
            hints: Vec::new(),
        }
    }

    /// Lower to the structured report
    #[must_use]
    pub fn to_report(&self) -> ErrorReport {
        let mut report = ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            fields: Vec::new(),
            stage: None,
            artifact_version: None,
            current_stage: None,
            hints: Vec::new(),
        };
        match self {
            Self::Validation { fields, .. } => {
                report.fields.clone_from(fields);
                report.hints = fields
                    .iter()
                    .map(|f| RemediationHint::new("fix_field", f, "provide a non-empty value"))
                    .collect();
            }
            Self::Precondition {
                stage,
                current,
                artifact_version,
                items,
                hints,
                ..
            } => {
                report.stage = Some(*stage);
                report.current_stage = Some(*current);
                report.artifact_version = *artifact_version;
                report.fields.clone_from(items);
                report.hints.clone_from(hints);
            }
            Self::StageViolation { from, to } => {
                report.current_stage = Some(*from);
                report.hints = from
                    .allowed_next()
                    .iter()
                    .map(|next| {
                        RemediationHint::new("advance_to", next.to_string(), format!("{from} may only move to {next}"))
                    })
                    .collect();
                if report.hints.is_empty() {
                    report.hints.push(RemediationHint::new(
                        "none",
                        to.to_string(),
                        format!("{from} is terminal"),
                    ));
                }
            }
            Self::CollaboratorFailure {
                stage,
                collaborator,
                artifact_version,
                ..
            } => {
                report.stage = Some(*stage);
                report.artifact_version = *artifact_version;
                report.hints.push(RemediationHint::new(
                    "retry_stage",
                    stage.to_string(),
                    format!("{collaborator} is unavailable; re-run the stage later"),
                ));
            }
            Self::ConcurrentVersionConflict { stage, version } | Self::Store(StoreError::VersionConflict { stage, version, .. }) => {
                report.stage = Some(*stage);
                report.artifact_version = Some(*version);
                report.hints.push(RemediationHint::new(
                    "retry_stage",
                    stage.to_string(),
                    "re-read the latest artifact and retry",
                ));
            }
            Self::InsufficientEvidence {
                sections,
                artifact_version,
            } => {
                report.stage = Some(Stage::Retrieve);
                report.artifact_version = *artifact_version;
                report.fields = sections.iter().map(|s| s.section.clone()).collect();
                for s in sections {
                    if !s.remaining_filters.is_empty() {
                        let dims: Vec<&str> = s.remaining_filters.iter().map(|d| d.key()).collect();
                        report.hints.push(RemediationHint::new(
                            "relax_filters",
                            s.section.clone(),
                            format!("add {} to the relaxation order", dims.join(", ")),
                        ));
                    }
                    report.hints.push(RemediationHint::new(
                        "add_override",
                        format!("evidence:{}", s.section),
                        format!("{} of {} required clause(s) found", s.found, s.required),
                    ));
                }
            }
            Self::UnknownCase(_) | Self::Cancelled(_) | Self::Artifact(_) | Self::Store(_) | Self::Config(_) => {}
        }
        report
    }

    /// Collaborator failure not tied to an input version
    #[must_use]
    pub fn collaborator(stage: Stage, collaborator: &str, attempts: u32, message: impl Into<String>) -> Self {
        Self::CollaboratorFailure {
            stage,
            collaborator: collaborator.to_string(),
            attempts,
            message: message.into(),
            artifact_version: None,
        }
    }

    /// Map a retrieval engine failure
    #[must_use]
    pub fn from_retrieval(error: RetrievalError, plan_version: u32) -> Self {
        match error {
            RetrievalError::InvalidSection { section, reason } => Self::Validation {
                message: format!("section '{section}': {reason}"),
                fields: vec![format!("sections.{section}")],
            },
            RetrievalError::Unavailable {
                attempts, last_error, ..
            } => Self::CollaboratorFailure {
                stage: Stage::Retrieve,
                collaborator: "knowledge".to_string(),
                attempts,
                message: last_error,
                artifact_version: Some(plan_version),
            },
            RetrievalError::Knowledge { source, .. } => Self::CollaboratorFailure {
                stage: Stage::Retrieve,
                collaborator: "knowledge".to_string(),
                attempts: 1,
                message: source.to_string(),
                artifact_version: Some(plan_version),
            },
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::VersionConflict { stage, version, .. } => Self::ConcurrentVersionConflict { stage, version },
            other => Self::Store(other),
        }
    }
}

/// Failures reported by a Planner, Writer or Reviewer capability
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Output failed schema validation; a re-prompt may fix it
    #[error("malformed output: {0}")]
    Malformed(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Refused outright; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),
}

impl sow_retrieval::Transient for CollaboratorError {
    fn is_transient(&self) -> bool {
        !matches!(self, CollaboratorError::Rejected(_))
    }
}

/// Plan schema violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("plan has no sections")]
    NoSections,

    #[error("duplicate section '{0}'")]
    DuplicateSection(String),

    #[error("invalid section '{section}': {reason}")]
    InvalidSection { section: String, reason: String },
}

impl From<PlanError> for CollaboratorError {
    fn from(error: PlanError) -> Self {
        CollaboratorError::Malformed(error.to_string())
    }
}
