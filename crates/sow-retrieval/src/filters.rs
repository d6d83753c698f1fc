//! Retrieval filter vocabulary
//!
//! The section a query is scoped to is not a [`FilterDimension`]: it lives in
//! its own field on [`RetrievalQuery`], so no relaxation order can name it.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A relaxable metadata filter dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterDimension {
    ClauseType,
    Tags,
    RiskLevel,
    Industry,
    Region,
    DeploymentModel,
    ArchitecturePattern,
    ServiceFamily,
    ComplianceScope,
}

impl FilterDimension {
    /// Every dimension, in canonical order
    pub const ALL: [FilterDimension; 9] = [
        FilterDimension::ClauseType,
        FilterDimension::Tags,
        FilterDimension::RiskLevel,
        FilterDimension::Industry,
        FilterDimension::Region,
        FilterDimension::DeploymentModel,
        FilterDimension::ArchitecturePattern,
        FilterDimension::ServiceFamily,
        FilterDimension::ComplianceScope,
    ];

    /// Default relaxation order: tags, industry, region, risk level
    pub const DEFAULT_RELAXATION: [FilterDimension; 4] = [
        FilterDimension::Tags,
        FilterDimension::Industry,
        FilterDimension::Region,
        FilterDimension::RiskLevel,
    ];

    /// Metadata key
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            FilterDimension::ClauseType => "clause_type",
            FilterDimension::Tags => "tags",
            FilterDimension::RiskLevel => "risk_level",
            FilterDimension::Industry => "industry",
            FilterDimension::Region => "region",
            FilterDimension::DeploymentModel => "deployment_model",
            FilterDimension::ArchitecturePattern => "architecture_pattern",
            FilterDimension::ServiceFamily => "service_family",
            FilterDimension::ComplianceScope => "compliance_scope",
        }
    }
}

impl fmt::Display for FilterDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for FilterDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("section") {
            return Err("section is not a relaxable filter".to_string());
        }
        Self::ALL
            .into_iter()
            .find(|d| d.key().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown filter dimension: {s}"))
    }
}

/// Clause risk level, ordered from least to most exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" | "moderate" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// Filter value: a single term or a term list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Text(String),
    List(Vec<String>),
}

impl FilterValue {
    /// Whether the value carries nothing worth sending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            FilterValue::Text(s) => s.trim().is_empty(),
            FilterValue::List(items) => items.iter().all(|s| s.trim().is_empty()),
        }
    }

    /// Terms held by this value
    #[must_use]
    pub fn terms(&self) -> Vec<&str> {
        match self {
            FilterValue::Text(s) => vec![s.as_str()],
            FilterValue::List(items) => items.iter().map(String::as_str).collect(),
        }
    }

    /// First term, if any
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        self.terms().into_iter().find(|t| !t.trim().is_empty())
    }

    /// Whether a stored value satisfies this filter
    ///
    /// A text filter needs an equal term (case-insensitive); a list filter
    /// needs at least one shared term.
    #[must_use]
    pub fn matches(&self, stored: &FilterValue) -> bool {
        let stored = stored.terms();
        self.terms()
            .into_iter()
            .filter(|t| !t.trim().is_empty())
            .any(|wanted| stored.iter().any(|have| have.trim().eq_ignore_ascii_case(wanted.trim())))
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<Vec<String>> for FilterValue {
    fn from(value: Vec<String>) -> Self {
        FilterValue::List(value)
    }
}

impl From<RiskLevel> for FilterValue {
    fn from(value: RiskLevel) -> Self {
        FilterValue::Text(value.as_str().to_string())
    }
}

static INTAKE_TEMPLATE: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^\{\{\s*intake\.([A-Za-z0-9_]+)\s*\}\}$"));

/// Field name referenced by an `{{intake.<field>}}` template, if `value` is one
#[must_use]
pub fn intake_template_field(value: &str) -> Option<&str> {
    let re = INTAKE_TEMPLATE.as_ref().ok()?;
    re.captures(value.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Ordered, non-empty filter assignments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(BTreeMap<FilterDimension, FilterValue>);

impl FilterSet {
    /// Empty set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an assignment; empty values are dropped
    #[must_use]
    pub fn with(mut self, dimension: FilterDimension, value: impl Into<FilterValue>) -> Self {
        self.insert(dimension, value);
        self
    }

    /// Insert an assignment; empty values are dropped
    pub fn insert(&mut self, dimension: FilterDimension, value: impl Into<FilterValue>) {
        let value = value.into();
        if value.is_empty() {
            self.0.remove(&dimension);
        } else {
            self.0.insert(dimension, value);
        }
    }

    /// Value for a dimension
    #[must_use]
    pub fn get(&self, dimension: FilterDimension) -> Option<&FilterValue> {
        self.0.get(&dimension)
    }

    /// Whether the dimension is assigned
    #[must_use]
    pub fn contains(&self, dimension: FilterDimension) -> bool {
        self.0.contains_key(&dimension)
    }

    /// Remove a dimension
    pub fn remove(&mut self, dimension: FilterDimension) -> Option<FilterValue> {
        self.0.remove(&dimension)
    }

    /// Iterate assignments in dimension order
    pub fn iter(&self) -> impl Iterator<Item = (FilterDimension, &FilterValue)> {
        self.0.iter().map(|(d, v)| (*d, v))
    }

    /// Assigned dimensions
    #[must_use]
    pub fn dimensions(&self) -> Vec<FilterDimension> {
        self.0.keys().copied().collect()
    }

    /// Number of assignments
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether nothing is assigned
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replace `{{intake.<field>}}` values through `lookup`
    ///
    /// Templates that resolve to nothing are removed; plain values and list
    /// values pass through unchanged.
    #[must_use]
    pub fn resolve_templates<F>(self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<FilterValue>,
    {
        let mut out = FilterSet::new();
        for (dimension, value) in self.0 {
            let resolved = match &value {
                FilterValue::Text(text) => match intake_template_field(text) {
                    Some(field) => lookup(field),
                    None => Some(value),
                },
                FilterValue::List(_) => Some(value),
            };
            if let Some(resolved) = resolved {
                out.insert(dimension, resolved);
            }
        }
        out
    }
}

/// Intake-derived values used when a section leaves a dimension unset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalContext {
    values: FilterSet,
}

impl RetrievalContext {
    /// Empty context
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context value; `None` and empty values are ignored
    #[must_use]
    pub fn with(mut self, dimension: FilterDimension, value: Option<impl Into<FilterValue>>) -> Self {
        if let Some(value) = value {
            self.values.insert(dimension, value);
        }
        self
    }

    /// Context value for a dimension
    #[must_use]
    pub fn get(&self, dimension: FilterDimension) -> Option<&FilterValue> {
        self.values.get(dimension)
    }

    /// All context values
    #[must_use]
    pub fn values(&self) -> &FilterSet {
        &self.values
    }
}

/// One query against the knowledge capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalQuery {
    /// Section scope, present on every attempt
    pub section: String,
    /// Metadata filters
    pub filters: FilterSet,
}

impl RetrievalQuery {
    /// Query scoped to `section` with no filters
    #[must_use]
    pub fn for_section(section: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            filters: FilterSet::new(),
        }
    }

    /// Same query with `dimensions` removed
    #[must_use]
    pub fn without(&self, dimensions: &[FilterDimension]) -> Self {
        let mut filters = self.filters.clone();
        for dimension in dimensions {
            filters.remove(*dimension);
        }
        Self {
            section: self.section.clone(),
            filters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_is_not_a_dimension() {
        assert!("section".parse::<FilterDimension>().is_err());
        assert!(serde_json::from_str::<FilterDimension>("\"section\"").is_err());
        assert_eq!("Industry".parse::<FilterDimension>().unwrap(), FilterDimension::Industry);
    }

    #[test]
    fn empty_values_are_never_stored() {
        let set = FilterSet::new()
            .with(FilterDimension::Industry, "")
            .with(FilterDimension::Tags, Vec::<String>::new())
            .with(FilterDimension::Region, "emea");
        assert_eq!(set.dimensions(), vec![FilterDimension::Region]);
    }

    #[test]
    fn list_filter_matches_on_overlap() {
        let wanted = FilterValue::List(vec!["sla".into(), "uptime".into()]);
        let stored = FilterValue::List(vec!["Uptime".into(), "support".into()]);
        assert!(wanted.matches(&stored));
        assert!(!wanted.matches(&FilterValue::Text("billing".into())));
        assert!(FilterValue::Text("EMEA".into()).matches(&FilterValue::Text("emea".into())));
    }

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::High);
        assert_eq!("Moderate".parse::<RiskLevel>().unwrap(), RiskLevel::Medium);
        assert!("extreme".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn templates_resolve_or_vanish() {
        let set = FilterSet::new()
            .with(FilterDimension::Industry, "{{intake.industry}}")
            .with(FilterDimension::Region, "{{ intake.region }}")
            .with(FilterDimension::ClauseType, "liability");

        let resolved = set.resolve_templates(|field| match field {
            "industry" => Some(FilterValue::from("healthcare")),
            _ => None,
        });

        assert_eq!(
            resolved.get(FilterDimension::Industry),
            Some(&FilterValue::from("healthcare"))
        );
        assert!(!resolved.contains(FilterDimension::Region));
        assert_eq!(
            resolved.get(FilterDimension::ClauseType),
            Some(&FilterValue::from("liability"))
        );
    }

    #[test]
    fn without_keeps_section() {
        let query = RetrievalQuery {
            section: "Scope".into(),
            filters: FilterSet::new()
                .with(FilterDimension::Tags, vec!["a".to_string()])
                .with(FilterDimension::Industry, "retail"),
        };
        let relaxed = query.without(&[FilterDimension::Tags, FilterDimension::Industry]);
        assert_eq!(relaxed.section, "Scope");
        assert!(relaxed.filters.is_empty());
    }
}
