//! Planned section specifications

use crate::error::RetrievalError;
use crate::filters::{FilterDimension, FilterSet, RiskLevel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Section category; decides how the section is written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionCategory {
    /// Filled from intake facts
    Template,
    /// Written from approved clauses
    #[default]
    Clause,
    /// Written from approved clauses and the architecture context
    Technical,
}

impl SectionCategory {
    /// Writer mode recorded on drafts
    #[must_use]
    pub const fn writer_mode(self) -> &'static str {
        match self {
            SectionCategory::Template => "template_fill",
            SectionCategory::Clause => "clause_grounded",
            SectionCategory::Technical => "technical_grounded",
        }
    }
}

/// Minimum content for one output field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinContent {
    /// Minimum word count of the field text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_words: Option<usize>,
    /// Minimum number of list items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_items: Option<usize>,
}

/// Low-recall fallback settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    /// Candidates required before relaxation stops; `None` uses the pipeline default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_candidates: Option<usize>,
    /// Dimensions dropped one at a time, cumulatively
    #[serde(default = "default_relaxation_order")]
    pub relaxation_order: Vec<FilterDimension>,
    /// Transient-failure retry budget per query; `None` uses the pipeline default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_relaxation_order() -> Vec<FilterDimension> {
    FilterDimension::DEFAULT_RELAXATION.to_vec()
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            min_candidates: None,
            relaxation_order: default_relaxation_order(),
            max_retries: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// One planned document section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSpec {
    pub name: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub category: SectionCategory,
    /// Output fields that must be non-empty
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Retrieval filters (section scope is implied by `name`)
    #[serde(default)]
    pub filters: FilterSet,
    #[serde(default)]
    pub min_content: BTreeMap<String, MinContent>,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    /// Mandatory sections must be drafted before review
    #[serde(default = "default_true")]
    pub mandatory: bool,
    /// Highest risk level the section may commit to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_risk: Option<RiskLevel>,
}

impl SectionSpec {
    /// Clause section with default fallback
    #[must_use]
    pub fn new(name: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            intent: intent.into(),
            category: SectionCategory::default(),
            required_fields: Vec::new(),
            filters: FilterSet::new(),
            min_content: BTreeMap::new(),
            fallback: FallbackPolicy::default(),
            mandatory: true,
            max_risk: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_category(mut self, category: SectionCategory) -> Self {
        self.category = category;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_min_candidates(mut self, min: usize) -> Self {
        self.fallback.min_candidates = Some(min);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_relaxation_order(mut self, order: Vec<FilterDimension>) -> Self {
        self.fallback.relaxation_order = order;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_required_fields(mut self, fields: Vec<String>) -> Self {
        self.required_fields = fields;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_min_content(mut self, field: impl Into<String>, min: MinContent) -> Self {
        self.min_content.insert(field.into(), min);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_max_risk(mut self, risk: RiskLevel) -> Self {
        self.max_risk = Some(risk);
        self
    }

    #[inline]
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }

    /// Whether the section goes through retrieval and the writer capability
    #[must_use]
    pub fn needs_evidence(&self) -> bool {
        self.category != SectionCategory::Template
    }

    /// Check structural invariants
    ///
    /// # Errors
    /// Returns `InvalidSection` for an empty name, a duplicated relaxation
    /// dimension, or a zero minimum
    pub fn validate(&self) -> Result<(), RetrievalError> {
        let invalid = |reason: &str| RetrievalError::InvalidSection {
            section: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("section name is empty"));
        }
        let mut seen = BTreeSet::new();
        if !self.fallback.relaxation_order.iter().all(|d| seen.insert(*d)) {
            return Err(invalid("relaxation order repeats a dimension"));
        }
        if self.fallback.min_candidates == Some(0) {
            return Err(invalid("min_candidates must be at least 1"));
        }
        Ok(())
    }
}
