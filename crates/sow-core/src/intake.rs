//! Intake record
//!
//! Fields are optional at the type level so a partial intake still parses;
//! [`Intake::validate`] reports every missing field at once.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use sow_retrieval::{FilterDimension, RetrievalContext};
use std::collections::BTreeMap;

/// Client profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

/// Optional structured context extracted from the intake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeContext {
    pub industry: Option<String>,
    pub region: Option<String>,
    pub deployment_model: Option<String>,
    pub architecture_pattern: Option<String>,
    pub compliance_scope: Option<String>,
    pub service_family: Option<String>,
    pub risk_level: Option<String>,
    pub clause_type: Option<String>,
    pub tags: Vec<String>,
}

/// One document-generation request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Intake {
    pub client: Option<ClientProfile>,
    pub scope: Option<String>,
    pub delivery_model: Option<String>,
    pub jurisdiction: Option<String>,
    pub context: IntakeContext,
    /// Free-form facts a template section or writer may cite
    pub facts: BTreeMap<String, String>,
}

fn blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

impl Intake {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_client(mut self, name: impl Into<String>) -> Self {
        self.client = Some(ClientProfile {
            name: name.into(),
            contact: None,
        });
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn with_delivery_model(mut self, model: impl Into<String>) -> Self {
        self.delivery_model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_jurisdiction(mut self, jurisdiction: impl Into<String>) -> Self {
        self.jurisdiction = Some(jurisdiction.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: IntakeContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.facts.insert(key.into(), value.into());
        self
    }

    /// Required fields that are missing or blank, in schema order
    #[must_use]
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        match &self.client {
            None => missing.push("client_profile".to_string()),
            Some(c) if c.name.trim().is_empty() => missing.push("client_profile.name".to_string()),
            Some(_) => {}
        }
        if blank(self.scope.as_deref()) {
            missing.push("scope".to_string());
        }
        if blank(self.delivery_model.as_deref()) {
            missing.push("delivery_model".to_string());
        }
        if blank(self.jurisdiction.as_deref()) {
            missing.push("jurisdiction".to_string());
        }
        missing
    }

    /// Validate the required fields
    ///
    /// # Errors
    /// `Validation` listing every missing field
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fields = self.missing_fields();
        if fields.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Validation {
                message: format!("intake is missing {} required field(s)", fields.len()),
                fields,
            })
        }
    }

    #[must_use]
    pub fn client_name(&self) -> &str {
        self.client.as_ref().map_or("", |c| c.name.as_str())
    }

    #[must_use]
    pub fn jurisdiction(&self) -> &str {
        self.jurisdiction.as_deref().unwrap_or("")
    }

    /// Resolve a named intake field; empty values resolve to `None`
    #[must_use]
    pub fn lookup(&self, field: &str) -> Option<String> {
        let ctx = &self.context;
        let value = match field {
            "client" | "client_name" => self.client.as_ref().map(|c| c.name.clone()),
            "scope" => self.scope.clone(),
            "delivery_model" => self.delivery_model.clone(),
            "jurisdiction" => self.jurisdiction.clone(),
            "industry" => ctx.industry.clone(),
            "region" => ctx.region.clone(),
            "deployment_model" => ctx.deployment_model.clone(),
            "architecture_pattern" => ctx.architecture_pattern.clone(),
            "compliance_scope" => ctx.compliance_scope.clone(),
            "service_family" => ctx.service_family.clone(),
            "risk_level" => ctx.risk_level.clone(),
            "clause_type" => ctx.clause_type.clone(),
            "tags" => (!ctx.tags.is_empty()).then(|| ctx.tags.join(",")),
            other => self.facts.get(other).cloned(),
        };
        value.filter(|v| !v.trim().is_empty())
    }

    /// Literal facts a paragraph may be grounded on
    #[must_use]
    pub fn facts(&self) -> BTreeMap<String, String> {
        let mut facts = self.facts.clone();
        for key in [
            "client",
            "scope",
            "delivery_model",
            "jurisdiction",
            "industry",
            "region",
            "deployment_model",
            "architecture_pattern",
            "compliance_scope",
            "service_family",
        ] {
            if let Some(value) = self.lookup(key) {
                facts.insert(key.to_string(), value);
            }
        }
        facts
    }

    /// Filter fallback values for retrieval
    #[must_use]
    pub fn retrieval_context(&self) -> RetrievalContext {
        let ctx = &self.context;
        let tags = (!ctx.tags.is_empty()).then(|| ctx.tags.clone());
        RetrievalContext::new()
            .with(FilterDimension::Industry, ctx.industry.clone())
            .with(FilterDimension::Region, ctx.region.clone())
            .with(FilterDimension::DeploymentModel, ctx.deployment_model.clone())
            .with(FilterDimension::ArchitecturePattern, ctx.architecture_pattern.clone())
            .with(FilterDimension::ComplianceScope, ctx.compliance_scope.clone())
            .with(FilterDimension::ServiceFamily, ctx.service_family.clone())
            .with(FilterDimension::RiskLevel, ctx.risk_level.clone())
            .with(FilterDimension::ClauseType, ctx.clause_type.clone())
            .with(FilterDimension::Tags, tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_missing_field_is_listed() {
        let err = Intake::new().with_scope("  ").validate().unwrap_err();
        match err {
            PipelineError::Validation { fields, .. } => assert_eq!(
                fields,
                vec!["client_profile", "scope", "delivery_model", "jurisdiction"]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn only_jurisdiction_missing() {
        let intake = Intake::new()
            .with_client("Acme")
            .with_scope("claims triage")
            .with_delivery_model("fixed_price");
        assert_eq!(intake.missing_fields(), vec!["jurisdiction"]);
    }

    #[test]
    fn context_feeds_retrieval_and_facts() {
        let intake = Intake::new()
            .with_client("Acme")
            .with_context(IntakeContext {
                industry: Some("healthcare".into()),
                region: Some(String::new()),
                tags: vec!["ai".into()],
                ..IntakeContext::default()
            })
            .with_fact("start_date", "2026-01-05");

        let ctx = intake.retrieval_context();
        assert!(ctx.get(FilterDimension::Industry).is_some());
        assert!(ctx.get(FilterDimension::Region).is_none());
        assert!(ctx.get(FilterDimension::Tags).is_some());

        assert_eq!(intake.lookup("industry").as_deref(), Some("healthcare"));
        assert_eq!(intake.lookup("region"), None);
        let facts = intake.facts();
        assert_eq!(facts.get("client").map(String::as_str), Some("Acme"));
        assert_eq!(facts.get("start_date").map(String::as_str), Some("2026-01-05"));
    }

    #[test]
    fn intake_parses_from_partial_json() {
        let intake: Intake = serde_json::from_str(r#"{"scope": "x", "context": {"industry": "retail"}}"#).unwrap();
        assert_eq!(intake.context.industry.as_deref(), Some("retail"));
        assert!(intake.client.is_none());
    }
}
