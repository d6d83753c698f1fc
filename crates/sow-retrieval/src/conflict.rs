//! Pairwise clause conflict detection
//!
//! Conflicts are flagged, never resolved: detection only reads the
//! candidate set and cannot remove anything from it.

use crate::candidate::ClauseCandidate;
use crate::filters::FilterValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What makes two clauses under the same rule incompatible
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ConflictCheck {
    /// Different risk levels
    RiskLevelMismatch,
    /// Different values for a metadata key
    MetadataMismatch { key: String },
}

/// One entry of the conflict rule table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRule {
    /// Clause type or tag both clauses must carry
    pub tag: String,
    #[serde(flatten)]
    pub check: ConflictCheck,
}

impl ConflictRule {
    /// Rule flagging risk-level disagreement between clauses tagged `tag`
    #[must_use]
    pub fn risk_mismatch(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            check: ConflictCheck::RiskLevelMismatch,
        }
    }

    /// Rule flagging disagreement on metadata `key` between clauses tagged `tag`
    #[must_use]
    pub fn metadata_mismatch(tag: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            check: ConflictCheck::MetadataMismatch { key: key.into() },
        }
    }

    /// Reason string recorded on a conflict
    #[must_use]
    pub fn reason(&self) -> String {
        match &self.check {
            ConflictCheck::RiskLevelMismatch => "risk_level_mismatch".to_string(),
            ConflictCheck::MetadataMismatch { key } => format!("{key}_mismatch"),
        }
    }

    fn conflicts(&self, a: &ClauseCandidate, b: &ClauseCandidate) -> bool {
        if !a.is_tagged(&self.tag) || !b.is_tagged(&self.tag) {
            return false;
        }
        match &self.check {
            ConflictCheck::RiskLevelMismatch => {
                matches!((a.risk_level, b.risk_level), (Some(x), Some(y)) if x != y)
            }
            ConflictCheck::MetadataMismatch { key } => {
                match (a.metadata.get(key), b.metadata.get(key)) {
                    (Some(x), Some(y)) => !same_terms(x, y),
                    _ => false,
                }
            }
        }
    }
}

fn same_terms(a: &FilterValue, b: &FilterValue) -> bool {
    let fold = |v: &FilterValue| -> BTreeSet<String> {
        v.terms().into_iter().map(|t| t.trim().to_lowercase()).collect()
    };
    fold(a) == fold(b)
}

/// A flagged pair of clauses
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Conflict {
    /// Lexicographically smaller clause id
    pub left: String,
    pub right: String,
    pub tag: String,
    pub reason: String,
}

impl Conflict {
    /// Stable key used by overrides
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.left, self.right, self.reason)
    }

    /// Whether the conflict involves `clause_id`
    #[must_use]
    pub fn involves(&self, clause_id: &str) -> bool {
        self.left == clause_id || self.right == clause_id
    }
}

/// Configured conflict rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictRuleTable {
    rules: Vec<ConflictRule>,
}

impl Default for ConflictRuleTable {
    fn default() -> Self {
        Self {
            rules: vec![
                ConflictRule::risk_mismatch("limitation_of_liability"),
                ConflictRule::risk_mismatch("indemnification"),
                ConflictRule::risk_mismatch("termination"),
                ConflictRule::metadata_mismatch("payment_terms", "payment_schedule"),
                ConflictRule::metadata_mismatch("service_level", "sla_target"),
            ],
        }
    }
}

impl ConflictRuleTable {
    /// Table with the given rules
    #[must_use]
    pub fn new(rules: Vec<ConflictRule>) -> Self {
        Self { rules }
    }

    /// Table without rules
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a rule
    #[must_use]
    pub fn with_rule(mut self, rule: ConflictRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Rules in evaluation order
    #[must_use]
    pub fn rules(&self) -> &[ConflictRule] {
        &self.rules
    }

    /// All conflicting pairs within a section's candidate set
    ///
    /// Output is sorted and free of duplicates, independent of input order.
    #[must_use]
    pub fn detect(&self, candidates: &[ClauseCandidate]) -> Vec<Conflict> {
        let mut found = BTreeSet::new();
        for (i, a) in candidates.iter().enumerate() {
            for b in &candidates[i + 1..] {
                if a.id == b.id {
                    continue;
                }
                for rule in &self.rules {
                    if rule.conflicts(a, b) {
                        let (left, right) = if a.id <= b.id { (a, b) } else { (b, a) };
                        found.insert(Conflict {
                            left: left.id.clone(),
                            right: right.id.clone(),
                            tag: rule.tag.clone(),
                            reason: rule.reason(),
                        });
                    }
                }
            }
        }
        found.into_iter().collect()
    }
}
