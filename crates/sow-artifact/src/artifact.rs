//! Immutable stage artifacts
//!
//! A [`StageArtifact`] is the sealed output of one stage run: the payload is
//! lowered to canonical JSON, checksummed, and never mutated afterwards. A
//! retry or edit produces version n+1.

use crate::hash::{ContentHash, HashError};
use crate::stage::{ArtifactRef, CaseId, IdempotencyKey, Stage};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Trait for typed stage payloads
///
/// Implement this for each stage's output schema (plan, retrieval set,
/// blueprint set, draft, review report).
///
/// # Contract
/// - `STAGE` is the only stage whose chain may hold this payload
/// - `validate_payload` enforces payload invariants before sealing
pub trait ArtifactPayload: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Stage that produces this payload
    const STAGE: Stage;

    /// Validate payload invariants
    ///
    /// Default implementation always succeeds.
    ///
    /// # Errors
    /// Returns error if the payload violates its invariants
    fn validate_payload(&self) -> Result<(), ArtifactError> {
        Ok(())
    }
}

/// Errors related to artifact operations
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// Payload invariant violation
    #[error("payload invariant violated: {0}")]
    InvariantViolation(String),

    /// Checksum mismatch (integrity check failed)
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Payload decoded against the wrong stage
    #[error("invalid stage: expected {expected}, got {actual}")]
    InvalidStage { expected: Stage, actual: Stage },

    /// Versions start at 1
    #[error("artifact versions start at 1")]
    ZeroVersion,

    /// Hashing failure
    #[error(transparent)]
    Hash(#[from] HashError),

    /// Payload (de)serialization failure
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Immutable record produced by one stage run
///
/// # Invariants
/// - `checksum` is always the canonical hash of `payload`
/// - `(case_id, stage, version)` is unique within a store
/// - `lineage` lists the exact input artifact versions it was derived from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageArtifact {
    case_id: CaseId,
    stage: Stage,
    version: u32,
    payload: serde_json::Value,
    checksum: ContentHash,
    created_at: DateTime<Utc>,
    idempotency_key: IdempotencyKey,
    lineage: Vec<ArtifactRef>,
}

impl StageArtifact {
    /// Seal a typed payload into an artifact
    ///
    /// # Errors
    /// Returns error if payload validation or serialization fails
    pub fn seal<P: ArtifactPayload>(
        case_id: CaseId,
        version: u32,
        payload: &P,
        idempotency_key: IdempotencyKey,
        lineage: Vec<ArtifactRef>,
    ) -> Result<Self, ArtifactError> {
        if version == 0 {
            return Err(ArtifactError::ZeroVersion);
        }
        payload.validate_payload()?;
        let payload = serde_json::to_value(payload)?;
        let checksum = ContentHash::of_payload(&payload)?;
        Ok(Self {
            case_id,
            stage: P::STAGE,
            version,
            payload,
            checksum,
            created_at: Utc::now(),
            idempotency_key,
            lineage,
        })
    }

    /// Same payload, sealed at a different version
    ///
    /// Used when an optimistic write lost the race for `version` and must be
    /// re-applied on top of the latest chain head.
    #[must_use]
    pub fn reversioned(&self, version: u32) -> Self {
        Self {
            version,
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Decode the payload as its typed schema
    ///
    /// # Errors
    /// Returns error on stage mismatch, checksum mismatch or decode failure
    pub fn decode<P: ArtifactPayload>(&self) -> Result<P, ArtifactError> {
        if self.stage != P::STAGE {
            return Err(ArtifactError::InvalidStage {
                expected: P::STAGE,
                actual: self.stage,
            });
        }
        let actual = ContentHash::of_payload(&self.payload)?;
        if actual != self.checksum {
            return Err(ArtifactError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Verify integrity (useful after deserialization)
    #[must_use]
    pub fn verify(&self) -> bool {
        ContentHash::of_payload(&self.payload)
            .map(|actual| actual == self.checksum)
            .unwrap_or(false)
    }

    /// Lineage pointer to this artifact
    #[inline]
    #[must_use]
    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef {
            stage: self.stage,
            version: self.version,
            checksum: self.checksum,
        }
    }

    /// Owning case
    #[inline]
    #[must_use]
    pub fn case_id(&self) -> CaseId {
        self.case_id
    }

    /// Producing stage
    #[inline]
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Version within the chain
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Raw payload
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Payload checksum
    #[inline]
    #[must_use]
    pub fn checksum(&self) -> &ContentHash {
        &self.checksum
    }

    /// Creation time
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Key of the invocation that produced this artifact
    #[inline]
    #[must_use]
    pub fn idempotency_key(&self) -> &IdempotencyKey {
        &self.idempotency_key
    }

    /// Input artifacts this one was derived from
    #[inline]
    #[must_use]
    pub fn lineage(&self) -> &[ArtifactRef] {
        &self.lineage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct NotePayload {
        note: String,
    }

    impl ArtifactPayload for NotePayload {
        const STAGE: Stage = Stage::Plan;

        fn validate_payload(&self) -> Result<(), ArtifactError> {
            if self.note.is_empty() {
                return Err(ArtifactError::InvariantViolation("empty note".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ReviewNote {
        note: String,
    }

    impl ArtifactPayload for ReviewNote {
        const STAGE: Stage = Stage::Review;
    }

    fn key(case: CaseId) -> IdempotencyKey {
        IdempotencyKey::derive(case, Stage::Plan, &[], None)
    }

    #[test]
    fn seal_and_decode() {
        let case = CaseId::new();
        let payload = NotePayload { note: "scope".into() };
        let artifact = StageArtifact::seal(case, 1, &payload, key(case), vec![]).unwrap();

        assert!(artifact.verify());
        assert_eq!(artifact.stage(), Stage::Plan);
        assert_eq!(artifact.decode::<NotePayload>().unwrap(), payload);
    }

    #[test]
    fn same_payload_same_checksum() {
        let case = CaseId::new();
        let payload = NotePayload { note: "scope".into() };
        let a = StageArtifact::seal(case, 1, &payload, key(case), vec![]).unwrap();
        let b = StageArtifact::seal(case, 2, &payload, key(case), vec![]).unwrap();
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn validation_rejects_invalid_payload() {
        let case = CaseId::new();
        let payload = NotePayload { note: String::new() };
        let result = StageArtifact::seal(case, 1, &payload, key(case), vec![]);
        assert!(matches!(result, Err(ArtifactError::InvariantViolation(_))));
    }

    #[test]
    fn version_zero_rejected() {
        let case = CaseId::new();
        let payload = NotePayload { note: "x".into() };
        let result = StageArtifact::seal(case, 0, &payload, key(case), vec![]);
        assert!(matches!(result, Err(ArtifactError::ZeroVersion)));
    }

    #[test]
    fn decode_rejects_wrong_stage() {
        let case = CaseId::new();
        let payload = NotePayload { note: "x".into() };
        let artifact = StageArtifact::seal(case, 1, &payload, key(case), vec![]).unwrap();
        let result = artifact.decode::<ReviewNote>();
        assert!(matches!(result, Err(ArtifactError::InvalidStage { .. })));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let case = CaseId::new();
        let payload = NotePayload { note: "x".into() };
        let artifact = StageArtifact::seal(case, 1, &payload, key(case), vec![]).unwrap();

        let mut raw = serde_json::to_value(&artifact).unwrap();
        raw["payload"]["note"] = serde_json::Value::String("tampered".into());
        let tampered: StageArtifact = serde_json::from_value(raw).unwrap();

        assert!(!tampered.verify());
        assert!(matches!(
            tampered.decode::<NotePayload>(),
            Err(ArtifactError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn reversioned_keeps_payload() {
        let case = CaseId::new();
        let payload = NotePayload { note: "x".into() };
        let artifact = StageArtifact::seal(case, 1, &payload, key(case), vec![]).unwrap();
        let moved = artifact.reversioned(3);
        assert_eq!(moved.version(), 3);
        assert_eq!(moved.checksum(), artifact.checksum());
        assert_eq!(moved.idempotency_key(), artifact.idempotency_key());
    }
}
