//! Drafted sections
//!
//! Drafts carry clause ids by value, not live references, so the lineage
//! from text back to evidence stays fixed even if retrieval is re-run.

use serde::{Deserialize, Serialize};
use sow_retrieval::SectionCategory;
use std::collections::BTreeMap;

/// One paragraph and the evidence it claims to rest on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftParagraph {
    pub text: String,
    /// Blueprint clause ids backing this paragraph
    #[serde(default)]
    pub clause_ids: Vec<String>,
    /// Intake fact keys backing this paragraph
    #[serde(default)]
    pub intake_facts: Vec<String>,
}

impl DraftParagraph {
    /// Paragraph backed by clauses
    #[must_use]
    pub fn from_clauses(text: impl Into<String>, clause_ids: Vec<String>) -> Self {
        Self {
            text: text.into(),
            clause_ids,
            intake_facts: Vec::new(),
        }
    }

    /// Paragraph backed by intake facts
    #[must_use]
    pub fn from_facts(text: impl Into<String>, facts: Vec<String>) -> Self {
        Self {
            text: text.into(),
            clause_ids: Vec::new(),
            intake_facts: facts,
        }
    }

    /// Paragraph with no mapping at all
    #[must_use]
    pub fn unmapped(text: impl Into<String>) -> Self {
        Self::from_clauses(text, Vec::new())
    }
}

/// Outcome of writing one section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DraftStatus {
    #[default]
    Drafted,
    /// The writer declined for lack of evidence
    NeedsInput,
}

/// Drafted text for one section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftSection {
    pub section: String,
    pub category: SectionCategory,
    pub writer_mode: String,
    #[serde(default)]
    pub status: DraftStatus,
    #[serde(default)]
    pub paragraphs: Vec<DraftParagraph>,
    /// Structured output fields checked against the section's requirements
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Why the writer returned `NEEDS_INPUT`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_input: Option<String>,
}

impl DraftSection {
    /// Empty draft for a section
    #[must_use]
    pub fn new(section: impl Into<String>, category: SectionCategory) -> Self {
        Self {
            section: section.into(),
            category,
            writer_mode: category.writer_mode().to_string(),
            status: DraftStatus::Drafted,
            paragraphs: Vec::new(),
            fields: BTreeMap::new(),
            needs_input: None,
        }
    }

    /// Writer declined the section
    #[must_use]
    pub fn needs_input(section: impl Into<String>, category: SectionCategory, reason: impl Into<String>) -> Self {
        Self {
            status: DraftStatus::NeedsInput,
            needs_input: Some(reason.into()),
            ..Self::new(section, category)
        }
    }

    #[must_use]
    pub fn with_paragraph(mut self, paragraph: DraftParagraph) -> Self {
        self.paragraphs.push(paragraph);
        self
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Whether the section has any drafted text
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.status == DraftStatus::NeedsInput
            || self.paragraphs.iter().all(|p| p.text.trim().is_empty())
    }

    /// Paragraph texts joined by blank lines
    #[must_use]
    pub fn text(&self) -> String {
        self.paragraphs
            .iter()
            .map(|p| p.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Every clause id referenced by this section
    #[must_use]
    pub fn referenced_clause_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .paragraphs
            .iter()
            .flat_map(|p| p.clause_ids.iter().map(String::as_str))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// A full draft: sections in plan order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub sections: Vec<DraftSection>,
}

impl Draft {
    /// Draft for a section by name
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&DraftSection> {
        self.sections.iter().find(|s| s.section == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_input_counts_as_empty() {
        let s = DraftSection::needs_input("Scope", SectionCategory::Clause, "no approved clauses");
        assert!(s.is_empty());
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["status"], "NEEDS_INPUT");
    }

    #[test]
    fn referenced_ids_are_unique_and_sorted() {
        let s = DraftSection::new("Scope", SectionCategory::Clause)
            .with_paragraph(DraftParagraph::from_clauses("a", vec!["c2".into(), "c1".into()]))
            .with_paragraph(DraftParagraph::from_clauses("b", vec!["c1".into()]));
        assert_eq!(s.referenced_clause_ids(), vec!["c1", "c2"]);
        assert_eq!(s.text(), "a\n\nb");
        assert!(!s.is_empty());
    }
}
