//! Built-in writers

use crate::collaborator::{WriteRequest, Writer};
use crate::error::CollaboratorError;
use crate::intake::Intake;
use async_trait::async_trait;
use serde_json::json;
use sow_retrieval::SectionSpec;
use sow_review::{DraftParagraph, DraftSection};

/// Deterministic writer that only reuses approved clause text
///
/// One paragraph per primary clause, mapped to that clause.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveWriter;

#[async_trait]
impl Writer for ExtractiveWriter {
    async fn write(&self, request: &WriteRequest) -> Result<DraftSection, CollaboratorError> {
        let spec = &request.section;
        let primaries = request.blueprint.primary_clauses();
        if primaries.is_empty() {
            return Ok(DraftSection::needs_input(
                &spec.name,
                spec.category,
                "no approved clauses for this section",
            ));
        }

        let mut draft = DraftSection::new(&spec.name, spec.category);
        for clause in &primaries {
            draft = draft.with_paragraph(DraftParagraph::from_clauses(clause.text.trim(), vec![clause.id.clone()]));
        }
        let ids: Vec<&str> = primaries.iter().map(|c| c.id.as_str()).collect();
        Ok(draft.with_field("clauses", json!(ids)))
    }
}

/// Fills template sections from intake facts
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateWriter;

impl TemplateWriter {
    /// Draft a template section
    ///
    /// Required fields are copied from the intake where it has them.
    #[must_use]
    pub fn fill(&self, spec: &SectionSpec, intake: &Intake) -> DraftSection {
        let client = intake.lookup("client");
        let scope = intake.lookup("scope");
        let mut facts = Vec::new();
        if client.is_some() {
            facts.push("client".to_string());
        }
        if scope.is_some() {
            facts.push("scope".to_string());
        }

        let text = format!(
            "{}: {}. Client={} scope={}",
            spec.name,
            spec.intent,
            client.as_deref().unwrap_or("n/a"),
            scope.as_deref().unwrap_or("n/a"),
        );
        let mut draft = DraftSection::new(&spec.name, spec.category).with_paragraph(DraftParagraph::from_facts(text, facts));
        for field in &spec.required_fields {
            if let Some(value) = intake.lookup(field) {
                draft = draft.with_field(field.clone(), json!(value));
            }
        }
        draft
    }
}
