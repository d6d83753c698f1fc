//! Pipeline configuration
//!
//! Every field has a default; a config file only names what it changes.
//! TOML and YAML are both accepted.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use sow_retrieval::{ConflictRuleTable, RetryPolicy, RiskLevel, SectionSpec};
use sow_review::ReviewPolicy;
use std::collections::BTreeMap;
use std::path::Path;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub planner_retry: RetryPolicy,
    pub knowledge_retry: RetryPolicy,
    pub writer_retry: RetryPolicy,
    pub reviewer_retry: RetryPolicy,
    /// Hits requested per knowledge query
    pub top_k: usize,
    /// Default minimum candidates before relaxation stops
    pub min_candidates: usize,
    /// Coverage needed per mandatory section to leave RETRIEVED
    pub min_primary_clauses: usize,
    pub primary_per_section: usize,
    pub min_clause_chars: usize,
    pub max_concurrent_sections: usize,
    pub conflict_rules: ConflictRuleTable,
    pub review: ReviewPolicy,
    pub style_profile: String,
    /// Section templates per document type
    pub taxonomy: BTreeMap<String, Vec<SectionSpec>>,
    /// Maximum risk per section name
    pub risk_matrix: BTreeMap<String, RiskLevel>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            planner_retry: RetryPolicy::default(),
            knowledge_retry: RetryPolicy::default(),
            writer_retry: RetryPolicy::default(),
            reviewer_retry: RetryPolicy::default(),
            top_k: 8,
            min_candidates: 5,
            min_primary_clauses: 1,
            primary_per_section: 2,
            min_clause_chars: 20,
            max_concurrent_sections: 4,
            conflict_rules: ConflictRuleTable::default(),
            review: ReviewPolicy::default(),
            style_profile: "formal".to_string(),
            taxonomy: BTreeMap::new(),
            risk_matrix: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    /// Parse TOML
    ///
    /// # Errors
    /// `Config` if the document does not match the schema
    pub fn from_toml_str(content: &str) -> Result<Self, PipelineError> {
        toml::from_str(content).map_err(|e| PipelineError::Config(format!("toml: {e}")))
    }

    /// Parse YAML
    ///
    /// # Errors
    /// `Config` if the document does not match the schema
    pub fn from_yaml_str(content: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(content).map_err(|e| PipelineError::Config(format!("yaml: {e}")))
    }

    /// Load a `.toml`, `.yaml` or `.yml` file
    ///
    /// # Errors
    /// `Config` if the file cannot be read, has another extension, or fails to parse
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::Config(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("yaml" | "yml") => Self::from_yaml_str(&content),
            other => Err(PipelineError::Config(format!(
                "unsupported config format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    /// Section templates for a document type
    #[must_use]
    pub fn taxonomy_for(&self, document_type: &str) -> Vec<SectionSpec> {
        self.taxonomy.get(document_type).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn with_planner_retry(mut self, retry: RetryPolicy) -> Self {
        self.planner_retry = retry;
        self
    }

    #[must_use]
    pub fn with_knowledge_retry(mut self, retry: RetryPolicy) -> Self {
        self.knowledge_retry = retry;
        self
    }

    #[must_use]
    pub fn with_writer_retry(mut self, retry: RetryPolicy) -> Self {
        self.writer_retry = retry;
        self
    }

    #[must_use]
    pub fn with_reviewer_retry(mut self, retry: RetryPolicy) -> Self {
        self.reviewer_retry = retry;
        self
    }

    #[must_use]
    pub fn with_min_candidates(mut self, min: usize) -> Self {
        self.min_candidates = min;
        self
    }

    #[must_use]
    pub fn with_min_primary_clauses(mut self, min: usize) -> Self {
        self.min_primary_clauses = min;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_sections(mut self, max: usize) -> Self {
        self.max_concurrent_sections = max;
        self
    }

    #[must_use]
    pub fn with_conflict_rules(mut self, rules: ConflictRuleTable) -> Self {
        self.conflict_rules = rules;
        self
    }

    #[must_use]
    pub fn with_review_policy(mut self, policy: ReviewPolicy) -> Self {
        self.review = policy;
        self
    }

    #[must_use]
    pub fn with_taxonomy(mut self, document_type: impl Into<String>, sections: Vec<SectionSpec>) -> Self {
        self.taxonomy.insert(document_type.into(), sections);
        self
    }

    #[must_use]
    pub fn with_risk_ceiling(mut self, section: impl Into<String>, max: RiskLevel) -> Self {
        self.risk_matrix.insert(section.into(), max);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sow_retrieval::FilterDimension;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(
            (c.top_k, c.min_candidates, c.min_primary_clauses, c.primary_per_section, c.min_clause_chars, c.max_concurrent_sections),
            (8, 5, 1, 2, 20, 4)
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = PipelineConfig::from_toml_str(
            r#"
            min_candidates = 3

            [knowledge_retry]
            max_attempts = 5

            [[taxonomy.sow]]
            name = "Limitation of Liability"
            intent = "bound exposure"
            category = "clause"

            [taxonomy.sow.fallback]
            min_candidates = 2
            relaxation_order = ["tags", "region"]

            [risk_matrix]
            "Limitation of Liability" = "medium"
            "#,
        )
        .unwrap();
        assert_eq!(c.min_candidates, 3);
        assert_eq!(c.knowledge_retry.max_attempts, 5);
        assert_eq!(c.knowledge_retry.initial_backoff_ms, 200);
        assert_eq!(c.top_k, 8);
        let sow = c.taxonomy_for("sow");
        assert_eq!(sow.len(), 1);
        assert_eq!(sow[0].fallback.relaxation_order, vec![FilterDimension::Tags, FilterDimension::Region]);
        assert_eq!(c.risk_matrix.get("Limitation of Liability"), Some(&RiskLevel::Medium));
    }

    #[test]
    fn yaml_is_accepted_and_bad_input_is_a_config_error() {
        let c = PipelineConfig::from_yaml_str("max_concurrent_sections: 2\nstyle_profile: plain\n").unwrap();
        assert_eq!(c.max_concurrent_sections, 2);
        assert_eq!(c.style_profile, "plain");

        let err = PipelineConfig::from_toml_str("top_k = \"many\"").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn load_dispatches_on_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yml");
        tokio::fs::write(&path, "top_k: 4\n").await.unwrap();
        assert_eq!(PipelineConfig::load(&path).await.unwrap().top_k, 4);

        let other = dir.path().join("pipeline.ini");
        tokio::fs::write(&other, "").await.unwrap();
        assert!(PipelineConfig::load(&other).await.is_err());
    }
}
