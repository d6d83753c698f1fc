//! Normalized clause candidates

use crate::filters::RiskLevel;
use crate::knowledge::ChunkMetadata;
use serde::{Deserialize, Serialize};

/// Provenance-tagged unit of retrieved evidence
///
/// # Invariants
/// - `source_uri` is resolvable and `text` is non-empty
/// - `id` is derived from the chunk id, or from the source URI when absent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClauseCandidate {
    pub id: String,
    pub source_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub text: String,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
    /// True when text came from the retrieval citation, false when recovered
    /// from the stored object
    pub provenance_confident: bool,
    /// Source URIs of duplicates merged into this candidate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_sources: Vec<String>,
}

impl ClauseCandidate {
    /// Identifier of the source lineage this clause belongs to
    #[must_use]
    pub fn lineage_id(&self) -> &str {
        self.document_id.as_deref().unwrap_or(&self.source_uri)
    }

    /// Whether the candidate carries `term` as clause type or tag
    #[must_use]
    pub fn is_tagged(&self, term: &str) -> bool {
        self.metadata.is_tagged(term)
    }
}
