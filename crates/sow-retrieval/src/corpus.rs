//! Local JSONL knowledge corpus
//!
//! One chunk record per line:
//!
//! ```json
//! {"chunk_id": "lol-001", "source_uri": "kb://msa/lol-001", "text": "...", "score": 0.82,
//!  "metadata": {"section": "Limitation of Liability", "clause_type": "limitation_of_liability",
//!               "risk_level": "low", "industry": "healthcare", "region": "emea",
//!               "deployment_model": "saas", "architecture_pattern": "multi_tenant",
//!               "service_family": "ai_platform", "compliance_scope": "hipaa",
//!               "tags": ["liability", "cap", "fees"]}}
//! ```
//!
//! Records without `text` are served through the stored-object map, which
//! exercises the normalizer's fetch path.

use crate::error::{CorpusError, KnowledgeError};
use crate::filters::RetrievalQuery;
use crate::knowledge::{KnowledgeCapability, KnowledgeHit};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// Metadata keys every knowledge-base record must carry
pub const REQUIRED_METADATA_KEYS: [&str; 10] = [
    "section",
    "clause_type",
    "risk_level",
    "industry",
    "region",
    "deployment_model",
    "architecture_pattern",
    "service_family",
    "compliance_scope",
    "tags",
];

/// Minimum number of tags per record
pub const MIN_TAGS: usize = 3;

/// In-memory, metadata-filtered knowledge capability
#[derive(Debug, Clone, Default)]
pub struct LocalCorpus {
    records: Vec<KnowledgeHit>,
    objects: HashMap<String, serde_json::Value>,
}

impl LocalCorpus {
    /// Empty corpus
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Corpus over the given records
    #[must_use]
    pub fn from_records(records: Vec<KnowledgeHit>) -> Self {
        Self {
            records,
            objects: HashMap::new(),
        }
    }

    /// Parse JSONL content; blank lines are skipped
    ///
    /// # Errors
    /// Returns the first line that fails to parse
    pub fn from_jsonl_str(content: &str) -> Result<Self, CorpusError> {
        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record = serde_json::from_str(line).map_err(|source| CorpusError::Parse {
                line: index + 1,
                source,
            })?;
            records.push(record);
        }
        Ok(Self::from_records(records))
    }

    /// Load a JSONL file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or a line fails to parse
    pub async fn from_jsonl_file(path: impl AsRef<Path>) -> Result<Self, CorpusError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_jsonl_str(&content)
    }

    /// Register a stored object for the fetch path
    #[must_use]
    pub fn with_object(mut self, source_uri: impl Into<String>, object: serde_json::Value) -> Self {
        self.objects.insert(source_uri.into(), object);
        self
    }

    /// Add one record
    #[must_use]
    pub fn with_record(mut self, record: KnowledgeHit) -> Self {
        self.records.push(record);
        self
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the corpus holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn matches(record: &KnowledgeHit, query: &RetrievalQuery) -> bool {
        let in_section = record
            .metadata
            .section()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case(query.section.trim()));
        in_section
            && query.filters.iter().all(|(dimension, wanted)| {
                record
                    .metadata
                    .dimension(dimension)
                    .is_some_and(|stored| wanted.matches(stored))
            })
    }
}

#[async_trait]
impl KnowledgeCapability for LocalCorpus {
    async fn query(&self, query: &RetrievalQuery, top_k: usize) -> Result<Vec<KnowledgeHit>, KnowledgeError> {
        let mut hits: Vec<&KnowledgeHit> = self
            .records
            .iter()
            .filter(|record| Self::matches(record, query))
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        Ok(hits.into_iter().take(top_k).cloned().collect())
    }

    async fn fetch_object(&self, source_uri: &str) -> Result<Option<serde_json::Value>, KnowledgeError> {
        Ok(self.objects.get(source_uri).cloned())
    }
}

/// One knowledge-base validation problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KbIssue {
    /// 1-based line number
    pub line: usize,
    pub message: String,
}

impl std::fmt::Display for KbIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Result of validating a knowledge-base file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KbReport {
    pub records: usize,
    pub issues: Vec<KbIssue>,
}

impl KbReport {
    /// Whether validation passed
    #[must_use]
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Validate knowledge-base JSONL metadata
///
/// Every record must carry all [`REQUIRED_METADATA_KEYS`] non-empty and at
/// least [`MIN_TAGS`] tags. Every issue is reported, not just the first.
#[must_use]
pub fn validate_kb(content: &str) -> KbReport {
    let mut report = KbReport::default();
    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        report.records += 1;

        let record: serde_json::Value = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(_) => {
                report.issues.push(KbIssue {
                    line: line_no,
                    message: "invalid JSON".to_string(),
                });
                continue;
            }
        };

        let empty = serde_json::Map::new();
        let metadata = record
            .get("metadata")
            .and_then(serde_json::Value::as_object)
            .unwrap_or(&empty);

        for key in REQUIRED_METADATA_KEYS {
            match metadata.get(key) {
                None => report.issues.push(KbIssue {
                    line: line_no,
                    message: format!("missing metadata.{key}"),
                }),
                Some(value) if is_empty_value(value) => report.issues.push(KbIssue {
                    line: line_no,
                    message: format!("empty metadata.{key}"),
                }),
                Some(_) => {}
            }
        }

        if let Some(tags) = metadata.get("tags").and_then(serde_json::Value::as_array) {
            if tags.len() < MIN_TAGS {
                report.issues.push(KbIssue {
                    line: line_no,
                    message: format!("under-tagged clause (<{MIN_TAGS} tags)"),
                });
            }
        }
    }
    report
}
