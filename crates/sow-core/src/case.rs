//! Case aggregate
//!
//! A case is mutated only by the orchestrator; artifacts live in the store
//! and are referenced, never copied, here.

use crate::intake::Intake;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sow_artifact::{CaseId, Stage};
use std::fmt;
use std::str::FromStr;

/// Case state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStage {
    Init,
    PlanReady,
    Retrieved,
    Assembled,
    Drafted,
    Reviewed,
    Approved,
    /// Reviewed draft sent back for remediation
    Rework,
}

impl CaseStage {
    /// Every state
    pub const ALL: [CaseStage; 8] = [
        CaseStage::Init,
        CaseStage::PlanReady,
        CaseStage::Retrieved,
        CaseStage::Assembled,
        CaseStage::Drafted,
        CaseStage::Reviewed,
        CaseStage::Approved,
        CaseStage::Rework,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CaseStage::Init => "INIT",
            CaseStage::PlanReady => "PLAN_READY",
            CaseStage::Retrieved => "RETRIEVED",
            CaseStage::Assembled => "ASSEMBLED",
            CaseStage::Drafted => "DRAFTED",
            CaseStage::Reviewed => "REVIEWED",
            CaseStage::Approved => "APPROVED",
            CaseStage::Rework => "REWORK",
        }
    }

    /// State entered when `stage` commits
    #[must_use]
    pub const fn after(stage: Stage) -> Self {
        match stage {
            Stage::Plan => CaseStage::PlanReady,
            Stage::Retrieve => CaseStage::Retrieved,
            Stage::Assemble => CaseStage::Assembled,
            Stage::Write => CaseStage::Drafted,
            Stage::Review => CaseStage::Reviewed,
        }
    }
}

impl fmt::Display for CaseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an override releases
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverrideTarget {
    /// A section below the evidence threshold
    Evidence { section: String },
    /// One flagged clause conflict
    Conflict {
        section: String,
        left: String,
        right: String,
    },
    /// One review finding
    Finding { id: String },
}

/// Escape `%` and `:` inside one conflict-target part
fn escape_part(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

fn unescape_part(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let code = rest.get(at + 1..at + 3);
        match code {
            Some(c) if c.eq_ignore_ascii_case("3a") => out.push(':'),
            Some("25") => out.push('%'),
            _ => {
                out.push('%');
                rest = &rest[at + 1..];
                continue;
            }
        }
        rest = &rest[at + 3..];
    }
    out.push_str(rest);
    out
}

impl fmt::Display for OverrideTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideTarget::Evidence { section } => write!(f, "evidence:{section}"),
            OverrideTarget::Conflict { section, left, right } => write!(
                f,
                "conflict:{}:{}:{}",
                escape_part(section),
                escape_part(left),
                escape_part(right)
            ),
            OverrideTarget::Finding { id } => write!(f, "finding:{id}"),
        }
    }
}

impl FromStr for OverrideTarget {
    type Err = String;

    /// Parse the `Display` form
    ///
    /// Conflict parts are separated by `:`; a `:` inside a section or clause
    /// id is written `%3A` and a literal `%` is written `%25`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let nonempty = |v: &str| !v.trim().is_empty();
        match s.split_once(':') {
            Some(("evidence", section)) if nonempty(section) => Ok(OverrideTarget::Evidence {
                section: section.to_string(),
            }),
            Some(("finding", id)) if nonempty(id) => Ok(OverrideTarget::Finding { id: id.to_string() }),
            Some(("conflict", rest)) => {
                let parts: Vec<&str> = rest.split(':').collect();
                match parts.as_slice() {
                    [section, left, right] if parts.iter().all(|v| nonempty(v)) => Ok(OverrideTarget::Conflict {
                        section: unescape_part(section),
                        left: unescape_part(left),
                        right: unescape_part(right),
                    }),
                    _ => Err(format!(
                        "conflict target needs section:left:right with ':' inside a part written %3A, got {rest:?}"
                    )),
                }
            }
            _ => Err(format!("unknown override target: {s}")),
        }
    }
}

/// Logged, attributed release of a gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Override {
    pub target: OverrideTarget,
    pub reason: String,
    pub approver: String,
    pub at: DateTime<Utc>,
}

/// Approval of one plan version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLock {
    pub version: u32,
    pub approver: String,
    pub at: DateTime<Utc>,
}

/// One document-generation request and its progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub stage: CaseStage,
    pub created_at: DateTime<Utc>,
    pub document_type: String,
    pub intake: Intake,
    #[serde(default)]
    pub plan_lock: Option<PlanLock>,
    #[serde(default)]
    pub overrides: Vec<Override>,
    /// Stage to re-run while in `REWORK`
    #[serde(default)]
    pub rework_target: Option<Stage>,
    #[serde(default)]
    pub cancelled: bool,
    /// States entered, in order
    #[serde(default)]
    pub history: Vec<CaseStage>,
}

impl Case {
    #[must_use]
    pub fn new(intake: Intake, document_type: impl Into<String>) -> Self {
        Self {
            id: CaseId::new(),
            stage: CaseStage::Init,
            created_at: Utc::now(),
            document_type: document_type.into(),
            intake,
            plan_lock: None,
            overrides: Vec::new(),
            rework_target: None,
            cancelled: false,
            history: vec![CaseStage::Init],
        }
    }

    /// Whether an override releases `target`
    #[must_use]
    pub fn is_overridden(&self, target: &OverrideTarget) -> bool {
        self.overrides.iter().any(|o| &o.target == target)
    }

    /// Record an override; a repeated target replaces the earlier entry
    pub fn add_override(&mut self, value: Override) {
        self.overrides.retain(|o| o.target != value.target);
        self.overrides.push(value);
    }

    /// Enter a new state
    pub fn enter(&mut self, next: CaseStage) {
        self.stage = next;
        self.history.push(next);
    }
}
