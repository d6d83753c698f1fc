//! Section blueprint assembly

use crate::candidate::ClauseCandidate;
use crate::conflict::{Conflict, ConflictRuleTable};
use crate::section::{SectionCategory, SectionSpec};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Role a clause plays within its section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClauseRole {
    Primary,
    Alternative,
}

/// One ordered slot of a blueprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintEntry {
    pub clause_id: String,
    pub role: ClauseRole,
    pub score: f64,
}

/// Ordered, conflict-annotated clause arrangement for one section
///
/// # Invariants
/// - each clause id appears at most once in `entries`
/// - `clauses` holds exactly the clauses named by `entries`, in entry order
/// - every detected conflict is listed; no clause is dropped to avoid one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionBlueprint {
    pub section: String,
    pub intent: String,
    pub category: SectionCategory,
    pub entries: Vec<BlueprintEntry>,
    pub conflicts: Vec<Conflict>,
    /// Copies of the approved clauses, for the writer
    pub clauses: Vec<ClauseCandidate>,
}

impl SectionBlueprint {
    /// Ids of primary clauses
    #[must_use]
    pub fn primary_ids(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.role == ClauseRole::Primary)
            .map(|e| e.clause_id.as_str())
            .collect()
    }

    /// Number of primary clauses
    #[must_use]
    pub fn primary_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.role == ClauseRole::Primary)
            .count()
    }

    /// Whether `clause_id` is part of this blueprint
    #[must_use]
    pub fn contains(&self, clause_id: &str) -> bool {
        self.entries.iter().any(|e| e.clause_id == clause_id)
    }

    /// Approved clause by id
    #[must_use]
    pub fn clause(&self, clause_id: &str) -> Option<&ClauseCandidate> {
        self.clauses.iter().find(|c| c.id == clause_id)
    }

    /// Primary clauses in order
    #[must_use]
    pub fn primary_clauses(&self) -> Vec<&ClauseCandidate> {
        self.primary_ids()
            .into_iter()
            .filter_map(|id| self.clause(id))
            .collect()
    }
}

/// Ranking: score descending, then a boost when the clause text names the
/// section, then id ascending
fn rank(section: &str, a: &ClauseCandidate, b: &ClauseCandidate) -> Ordering {
    let needle = section.to_lowercase();
    let boost = |c: &ClauseCandidate| u8::from(!needle.is_empty() && c.text.to_lowercase().contains(&needle));
    b.score
        .total_cmp(&a.score)
        .then_with(|| boost(b).cmp(&boost(a)))
        .then_with(|| a.id.cmp(&b.id))
}

/// Arrange a section's final candidate set into a blueprint
///
/// The top `primary_per_section` clauses are primary, the rest alternatives.
#[must_use]
pub fn assemble_blueprint(
    spec: &SectionSpec,
    candidates: &[ClauseCandidate],
    rules: &ConflictRuleTable,
    primary_per_section: usize,
) -> SectionBlueprint {
    let mut seen = HashSet::new();
    let mut ordered: Vec<ClauseCandidate> = candidates
        .iter()
        .filter(|c| seen.insert(c.id.clone()))
        .cloned()
        .collect();
    ordered.sort_by(|a, b| rank(&spec.name, a, b));

    let entries = ordered
        .iter()
        .enumerate()
        .map(|(i, c)| BlueprintEntry {
            clause_id: c.id.clone(),
            role: if i < primary_per_section {
                ClauseRole::Primary
            } else {
                ClauseRole::Alternative
            },
            score: c.score,
        })
        .collect();

    let conflicts = rules.detect(&ordered);
    if !conflicts.is_empty() {
        tracing::warn!(section = %spec.name, count = conflicts.len(), "clause conflicts flagged");
    }

    SectionBlueprint {
        section: spec.name.clone(),
        intent: spec.intent.clone(),
        category: spec.category,
        entries,
        conflicts,
        clauses: ordered,
    }
}
