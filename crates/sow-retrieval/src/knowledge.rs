//! Knowledge capability contract
//!
//! The corpus itself is external. The engine only needs two calls: a
//! filtered, scored query and a fetch of the stored object behind a source
//! URI for hits that came back without citation text.

use crate::error::KnowledgeError;
use crate::filters::{FilterDimension, FilterValue, RetrievalQuery, RiskLevel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata attached to a stored chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkMetadata(BTreeMap<String, FilterValue>);

impl ChunkMetadata {
    /// Empty metadata
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw value for a key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FilterValue> {
        self.0.get(key)
    }

    /// Value for a filter dimension
    #[must_use]
    pub fn dimension(&self, dimension: FilterDimension) -> Option<&FilterValue> {
        self.get(dimension.key())
    }

    /// Section the chunk was indexed under
    #[must_use]
    pub fn section(&self) -> Option<&str> {
        self.get("section").and_then(FilterValue::as_text)
    }

    /// Clause type, if tagged
    #[must_use]
    pub fn clause_type(&self) -> Option<&str> {
        self.get("clause_type").and_then(FilterValue::as_text)
    }

    /// Parsed risk level; unparseable values read as absent
    #[must_use]
    pub fn risk_level(&self) -> Option<RiskLevel> {
        self.get("risk_level")
            .and_then(FilterValue::as_text)
            .and_then(|s| s.parse().ok())
    }

    /// Tag list
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        self.get("tags").map(FilterValue::terms).unwrap_or_default()
    }

    /// Whether the chunk carries `term` as clause type or tag
    #[must_use]
    pub fn is_tagged(&self, term: &str) -> bool {
        self.clause_type()
            .is_some_and(|ct| ct.eq_ignore_ascii_case(term))
            || self.tags().iter().any(|t| t.eq_ignore_ascii_case(term))
    }

    /// Iterate entries
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FilterValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// One raw result from a knowledge query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeHit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Citation text, when the backend returned it inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

/// External knowledge corpus
#[async_trait]
pub trait KnowledgeCapability: Send + Sync {
    /// Ranked hits for a section-scoped query
    ///
    /// Filters absent from `query` must not constrain the result.
    ///
    /// # Errors
    /// Returns a transient error for timeouts and outages
    async fn query(&self, query: &RetrievalQuery, top_k: usize) -> Result<Vec<KnowledgeHit>, KnowledgeError>;

    /// Stored object behind a source URI, if it exists
    ///
    /// # Errors
    /// Returns a transient error for timeouts and outages
    async fn fetch_object(&self, source_uri: &str) -> Result<Option<serde_json::Value>, KnowledgeError>;
}
