//! Grounding & policy validator
//!
//! Checks are independent and their findings are unioned. The validator
//! never rewrites the draft; it only reports.

use crate::draft::{Draft, DraftSection, DraftStatus};
use crate::finding::{sort_findings, Finding, FindingCategory, Location, Severity};
use crate::policy::ReviewPolicy;
use regex::Regex;
use sow_retrieval::{RiskLevel, SectionBlueprint, SectionSpec};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::debug;

/// Validator construction errors
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("invalid pattern for numeric key '{key}': {source}")]
    InvalidPattern {
        key: String,
        #[source]
        source: regex::Error,
    },
}

/// Evidence one drafted section is checked against
#[derive(Debug, Clone, Copy)]
pub struct SectionContext<'a> {
    pub spec: Option<&'a SectionSpec>,
    pub blueprint: Option<&'a SectionBlueprint>,
    pub intake_facts: &'a BTreeMap<String, String>,
    pub jurisdiction: &'a str,
}

/// Everything a full-draft review needs
#[derive(Debug, Clone, Copy)]
pub struct ReviewInput<'a> {
    pub draft: &'a Draft,
    pub specs: &'a [SectionSpec],
    pub blueprints: &'a [SectionBlueprint],
    pub intake_facts: &'a BTreeMap<String, String>,
    pub jurisdiction: &'a str,
}

impl<'a> ReviewInput<'a> {
    fn context_for(&self, section: &str) -> SectionContext<'a> {
        SectionContext {
            spec: self.specs.iter().find(|s| s.name == section),
            blueprint: self.blueprints.iter().find(|b| b.section == section),
            intake_facts: self.intake_facts,
            jurisdiction: self.jurisdiction,
        }
    }
}

/// Deterministic grounding and policy checks over drafts
#[derive(Debug, Clone)]
pub struct GroundingValidator {
    policy: ReviewPolicy,
    numeric: Vec<(String, Regex)>,
}

impl GroundingValidator {
    /// Compile a policy
    ///
    /// # Errors
    /// Returns error if a numeric key pattern is not a valid regex
    pub fn new(policy: ReviewPolicy) -> Result<Self, ReviewError> {
        let numeric = policy
            .numeric_keys
            .iter()
            .map(|k| {
                Regex::new(&k.pattern)
                    .map(|re| (k.key.clone(), re))
                    .map_err(|source| ReviewError::InvalidPattern {
                        key: k.key.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { policy, numeric })
    }

    #[inline]
    #[must_use]
    pub fn policy(&self) -> &ReviewPolicy {
        &self.policy
    }

    /// Check one drafted section against its blueprint, intake facts and policy
    #[must_use]
    pub fn validate_section(&self, draft: &DraftSection, ctx: &SectionContext<'_>) -> Vec<Finding> {
        let mut findings = Vec::new();
        let forbidden = self.policy.forbidden_for(ctx.jurisdiction);

        for (index, paragraph) in draft.paragraphs.iter().enumerate() {
            let text = paragraph.text.trim();
            if text.is_empty() {
                continue;
            }
            let lower = text.to_lowercase();
            let location = Location::paragraph(&draft.section, index);

            let clauses: Vec<_> = paragraph
                .clause_ids
                .iter()
                .filter_map(|id| ctx.blueprint.and_then(|b| b.clause(id)))
                .collect();
            let facts: Vec<&str> = paragraph
                .intake_facts
                .iter()
                .filter(|key| {
                    ctx.intake_facts
                        .get(key.as_str())
                        .is_some_and(|v| !v.trim().is_empty())
                })
                .map(String::as_str)
                .collect();

            // Grounding gate
            let grounded = !clauses.is_empty() || !facts.is_empty() || self.policy.is_boilerplate(text);
            if grounded {
                // Every cited id must name real evidence
                for id in &paragraph.clause_ids {
                    if ctx.blueprint.and_then(|b| b.clause(id)).is_none() {
                        findings.push(
                            Finding::new(
                                Severity::Warning,
                                FindingCategory::UnsupportedStatement,
                                location.clone(),
                                format!("grounding:unknown_clause:{id}"),
                                "drop the citation or replace it with an approved blueprint clause",
                            )
                            .with_evidence(id.clone()),
                        );
                    }
                }
            } else {
                let reference = if paragraph.clause_ids.is_empty() {
                    "grounding:no_mapping".to_string()
                } else {
                    format!("grounding:unmapped_clauses:{}", paragraph.clause_ids.join(","))
                };
                findings.push(
                    Finding::new(
                        Severity::Critical,
                        FindingCategory::UnsupportedStatement,
                        location.clone(),
                        reference,
                        "map the paragraph to an approved blueprint clause or intake fact, or remove it",
                    )
                    .with_evidence(snippet(text)),
                );
            }

            // Commitment classifier
            let clause_texts: Vec<String> = clauses.iter().map(|c| c.text.to_lowercase()).collect();
            for marker in matched_terms(&lower, &self.policy.absolute_markers) {
                let backed = clause_texts.iter().any(|t| t.contains(&marker));
                if !backed {
                    findings.push(
                        Finding::new(
                            Severity::Critical,
                            FindingCategory::UnsupportedCommitment,
                            location.clone(),
                            format!("commitment:{marker}"),
                            "soften the obligation or cite a clause that states it verbatim",
                        )
                        .with_evidence(marker),
                    );
                }
            }

            // Forbidden phrases
            for (phrase, rule) in &forbidden {
                let needle = phrase.to_lowercase();
                if !needle.is_empty() && lower.contains(&needle) {
                    findings.push(
                        Finding::new(
                            Severity::Critical,
                            FindingCategory::ForbiddenPhrase,
                            location.clone(),
                            rule.clone(),
                            format!("remove or rephrase '{phrase}'"),
                        )
                        .with_evidence(needle),
                    );
                }
            }

            // Risk conformance
            if let Some(max) = ctx.spec.and_then(|s| s.max_risk) {
                if let Some((implied, source)) = self.implied_risk(&lower, &clauses) {
                    let severity = match implied.cmp(&max) {
                        std::cmp::Ordering::Greater => Some(Severity::Critical),
                        std::cmp::Ordering::Equal => Some(Severity::Warning),
                        std::cmp::Ordering::Less => None,
                    };
                    if let Some(severity) = severity {
                        findings.push(
                            Finding::new(
                                severity,
                                FindingCategory::RiskPolicy,
                                location.clone(),
                                format!("max_risk:{max}"),
                                format!("implied risk '{implied}' against a ceiling of '{max}'; choose a lower-risk clause or obtain approval"),
                            )
                            .with_evidence(source),
                        );
                    }
                }
            }
        }

        if let Some(spec) = ctx.spec {
            findings.extend(self.completeness(draft, spec));
        }

        debug!(section = %draft.section, findings = findings.len(), "Section validated");
        findings
    }

    /// Check a full draft: every section plus cross-section numeric consistency
    ///
    /// Findings are sorted most severe first and deduplicated by id.
    #[must_use]
    pub fn validate_draft(&self, input: &ReviewInput<'_>) -> Vec<Finding> {
        let mut findings = Vec::new();

        for section in &input.draft.sections {
            findings.extend(self.validate_section(section, &input.context_for(&section.section)));
        }

        for spec in input.specs.iter().filter(|s| s.mandatory) {
            if input.draft.section(&spec.name).is_none() {
                findings.push(Finding::new(
                    Severity::Warning,
                    FindingCategory::IncompleteSection,
                    Location::section(&spec.name),
                    "mandatory_section",
                    "draft the mandatory section",
                ));
            }
        }

        findings.extend(self.numeric_consistency(input.draft));

        let mut seen = HashSet::new();
        findings.retain(|f| seen.insert(f.id.clone()));
        sort_findings(&mut findings);
        findings
    }

    /// Labelled figures in draft order: key → (location, value)
    #[must_use]
    pub fn extract_figures(&self, draft: &Draft) -> BTreeMap<String, Vec<(Location, String)>> {
        let mut figures: BTreeMap<String, Vec<(Location, String)>> = BTreeMap::new();
        for section in &draft.sections {
            for (index, paragraph) in section.paragraphs.iter().enumerate() {
                for (key, re) in &self.numeric {
                    for caps in re.captures_iter(&paragraph.text) {
                        if let Some(value) = caps.get(1) {
                            figures
                                .entry(key.clone())
                                .or_default()
                                .push((Location::paragraph(&section.section, index), canonical_figure(value.as_str())));
                        }
                    }
                }
            }
        }
        figures
    }

    fn numeric_consistency(&self, draft: &Draft) -> Vec<Finding> {
        let mut findings = Vec::new();
        for (key, occurrences) in self.extract_figures(draft) {
            let Some((baseline_at, baseline)) = occurrences.first() else {
                continue;
            };
            for (location, value) in occurrences.iter().skip(1) {
                if value != baseline {
                    findings.push(
                        Finding::new(
                            Severity::Critical,
                            FindingCategory::NumericInconsistency,
                            location.clone(),
                            format!("numeric:{key}"),
                            format!("align {key} with the value stated in {baseline_at}"),
                        )
                        .with_evidence(format!("{value} (expected {baseline})")),
                    );
                }
            }
        }
        findings
    }

    fn implied_risk(
        &self,
        lower: &str,
        clauses: &[&sow_retrieval::ClauseCandidate],
    ) -> Option<(RiskLevel, String)> {
        let from_terms = self
            .policy
            .risk_terms
            .iter()
            .filter(|t| lower.contains(&t.phrase.to_lowercase()))
            .map(|t| (t.risk, format!("phrase:{}", t.phrase)));
        let from_clauses = clauses
            .iter()
            .filter_map(|c| c.risk_level.map(|r| (r, format!("clause:{}", c.id))));
        from_terms
            .chain(from_clauses)
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
    }

    fn completeness(&self, draft: &DraftSection, spec: &SectionSpec) -> Vec<Finding> {
        let mut findings = Vec::new();
        let section = Location::section(&draft.section);

        if draft.status == DraftStatus::NeedsInput {
            findings.push(
                Finding::new(
                    Severity::Warning,
                    FindingCategory::IncompleteSection,
                    section.clone(),
                    "needs_input",
                    "supply evidence or intake data, then re-run retrieval or writing",
                )
                .with_evidence(draft.needs_input.clone().unwrap_or_default()),
            );
            return findings;
        }

        for field in &spec.required_fields {
            let present = field_value(draft, field).is_some_and(|v| !is_blank(&v));
            if !present {
                findings.push(Finding::new(
                    Severity::Warning,
                    FindingCategory::IncompleteSection,
                    section.clone(),
                    format!("required_field:{field}"),
                    format!("provide '{field}'"),
                ));
            }
        }

        for (field, min) in &spec.min_content {
            let value = field_value(draft, field);
            if let Some(min_words) = min.min_words {
                let words = value.as_ref().map_or(0, word_count);
                if words < min_words {
                    findings.push(
                        Finding::new(
                            Severity::Warning,
                            FindingCategory::IncompleteSection,
                            section.clone(),
                            format!("min_words:{field}"),
                            format!("expand '{field}' to at least {min_words} words"),
                        )
                        .with_evidence(format!("{words} words")),
                    );
                }
            }
            if let Some(min_items) = min.min_items {
                let items = value.as_ref().map_or(0, item_count);
                if items < min_items {
                    findings.push(
                        Finding::new(
                            Severity::Warning,
                            FindingCategory::IncompleteSection,
                            section.clone(),
                            format!("min_items:{field}"),
                            format!("list at least {min_items} items in '{field}'"),
                        )
                        .with_evidence(format!("{items} items")),
                    );
                }
            }
        }
        findings
    }
}

/// Terms present in `lower`, minus those contained in a longer match
fn matched_terms(lower: &str, terms: &[String]) -> Vec<String> {
    let hits: Vec<String> = terms
        .iter()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty() && lower.contains(t.as_str()))
        .collect();
    let mut out: Vec<String> = hits
        .iter()
        .filter(|t| !hits.iter().any(|o| o.len() > t.len() && o.contains(t.as_str())))
        .cloned()
        .collect();
    out.sort();
    out.dedup();
    out
}

fn snippet(text: &str) -> String {
    const MAX: usize = 80;
    match text.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn canonical_figure(raw: &str) -> String {
    match raw.parse::<f64>() {
        Ok(n) if n.is_finite() => format!("{n}"),
        _ => raw.trim().to_string(),
    }
}

/// Field value with the implicit `text` and `paragraphs` fields
fn field_value(draft: &DraftSection, name: &str) -> Option<serde_json::Value> {
    if let Some(v) = draft.fields.get(name) {
        return Some(v.clone());
    }
    match name {
        "text" => Some(serde_json::Value::String(draft.text())),
        "paragraphs" => Some(serde_json::Value::Array(
            draft
                .paragraphs
                .iter()
                .map(|p| serde_json::Value::String(p.text.clone()))
                .collect(),
        )),
        _ => None,
    }
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn word_count(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::String(s) => s.split_whitespace().count(),
        serde_json::Value::Array(items) => items.iter().map(word_count).sum(),
        _ => 0,
    }
}

fn item_count(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Array(items) => items.iter().filter(|v| !is_blank(v)).count(),
        serde_json::Value::String(s) => s.lines().filter(|l| !l.trim().is_empty()).count(),
        serde_json::Value::Object(map) => map.len(),
        serde_json::Value::Null => 0,
        _ => 1,
    }
}
