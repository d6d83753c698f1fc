//! Case identifiers, pipeline stages and idempotency keys

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Unique case identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CaseId(pub Ulid);

impl CaseId {
    /// Generate new case ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CaseId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// Pipeline stage that produces an artifact chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Section plan
    #[serde(rename = "PLAN")]
    Plan,
    /// Per-section clause candidates and retrieval diagnostics
    #[serde(rename = "RETRIEVAL_SET")]
    Retrieve,
    /// Per-section blueprints
    #[serde(rename = "ASSEMBLY_BLUEPRINT")]
    Assemble,
    /// Section drafts
    #[serde(rename = "DRAFT")]
    Write,
    /// Review findings
    #[serde(rename = "REVIEW_REPORT")]
    Review,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 5] = [
        Stage::Plan,
        Stage::Retrieve,
        Stage::Assemble,
        Stage::Write,
        Stage::Review,
    ];

    /// Persisted artifact name
    #[must_use]
    pub const fn artifact_name(self) -> &'static str {
        match self {
            Stage::Plan => "PLAN",
            Stage::Retrieve => "RETRIEVAL_SET",
            Stage::Assemble => "ASSEMBLY_BLUEPRINT",
            Stage::Write => "DRAFT",
            Stage::Review => "REVIEW_REPORT",
        }
    }

    /// Stages whose artifacts are derived from this one
    #[must_use]
    pub fn downstream(self) -> &'static [Stage] {
        match self {
            Stage::Plan => &[Stage::Retrieve, Stage::Assemble, Stage::Write, Stage::Review],
            Stage::Retrieve => &[Stage::Assemble, Stage::Write, Stage::Review],
            Stage::Assemble => &[Stage::Write, Stage::Review],
            Stage::Write => &[Stage::Review],
            Stage::Review => &[],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.artifact_name())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.artifact_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// Pointer to one persisted artifact version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Producing stage
    pub stage: Stage,
    /// Version within the (case, stage) chain
    pub version: u32,
    /// Checksum of the referenced payload
    pub checksum: ContentHash,
}

/// Key identifying one logical stage invocation
///
/// Derived from the case, the stage and the exact input artifact versions,
/// plus an optional caller token. Two invocations with the same key are the
/// same request and must yield the same artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(ContentHash);

impl IdempotencyKey {
    /// Derive the key for a stage invocation
    #[must_use]
    pub fn derive(
        case_id: CaseId,
        stage: Stage,
        inputs: &[ArtifactRef],
        request_token: Option<&str>,
    ) -> Self {
        let mut parts: Vec<Vec<u8>> = vec![
            case_id.to_string().into_bytes(),
            stage.artifact_name().as_bytes().to_vec(),
        ];
        for input in inputs {
            parts.push(input.stage.artifact_name().as_bytes().to_vec());
            parts.push(input.version.to_le_bytes().to_vec());
            parts.push(input.checksum.as_bytes().to_vec());
        }
        if let Some(token) = request_token {
            parts.push(token.as_bytes().to_vec());
        }
        Self(ContentHash::of_fields(parts))
    }

    /// Underlying hash
    #[inline]
    #[must_use]
    pub fn hash(&self) -> &ContentHash {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_ref(version: u32) -> ArtifactRef {
        ArtifactRef {
            stage: Stage::Plan,
            version,
            checksum: ContentHash::of(&version.to_le_bytes()),
        }
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.artifact_name().parse::<Stage>().unwrap(), stage);
        }
        assert!("bogus".parse::<Stage>().is_err());
    }

    #[test]
    fn downstream_is_strictly_later() {
        assert_eq!(Stage::Plan.downstream().len(), 4);
        assert_eq!(Stage::Assemble.downstream(), &[Stage::Write, Stage::Review]);
        assert!(Stage::Review.downstream().is_empty());
    }

    #[test]
    fn idempotency_key_depends_on_input_version() {
        let case = CaseId::new();
        let k1 = IdempotencyKey::derive(case, Stage::Retrieve, &[plan_ref(1)], None);
        let k1_again = IdempotencyKey::derive(case, Stage::Retrieve, &[plan_ref(1)], None);
        let k2 = IdempotencyKey::derive(case, Stage::Retrieve, &[plan_ref(2)], None);
        assert_eq!(k1, k1_again);
        assert_ne!(k1, k2);
    }

    #[test]
    fn idempotency_key_depends_on_token() {
        let case = CaseId::new();
        let plain = IdempotencyKey::derive(case, Stage::Write, &[], None);
        let tokened = IdempotencyKey::derive(case, Stage::Write, &[], Some("retry-2"));
        assert_ne!(plain, tokened);
    }

    #[test]
    fn stage_serializes_as_artifact_name() {
        let json = serde_json::to_string(&Stage::Assemble).unwrap();
        assert_eq!(json, "\"ASSEMBLY_BLUEPRINT\"");
    }
}
