//! Diagnostics recorder
//!
//! Append-only, hash-chained audit log of everything the orchestrator does
//! on behalf of a case. Each event's hash covers its content and the
//! previous event's hash, so any edit breaks the chain.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sow_artifact::{canonical_json, CaseId, ContentHash, Stage};

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CaseCreated,
    PlanLocked,
    /// One call to a planner, writer or reviewer
    CollaboratorAttempt,
    /// One query of the retrieval relaxation sequence
    RetrievalAttempt,
    StageCommitted,
    /// A stage call answered from an existing artifact
    IdempotentReplay,
    /// A write lost a version race and was re-applied
    VersionConflictRetried,
    /// Downstream chains marked superseded
    Superseded,
    OverrideAdded,
    ReworkRequested,
    Approved,
    Cancelled,
    /// A stage finished after its case was cancelled
    LateResultDiscarded,
    StageFailed,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::CaseCreated => "case_created",
            EventKind::PlanLocked => "plan_locked",
            EventKind::CollaboratorAttempt => "collaborator_attempt",
            EventKind::RetrievalAttempt => "retrieval_attempt",
            EventKind::StageCommitted => "stage_committed",
            EventKind::IdempotentReplay => "idempotent_replay",
            EventKind::VersionConflictRetried => "version_conflict_retried",
            EventKind::Superseded => "superseded",
            EventKind::OverrideAdded => "override_added",
            EventKind::ReworkRequested => "rework_requested",
            EventKind::Approved => "approved",
            EventKind::Cancelled => "cancelled",
            EventKind::LateResultDiscarded => "late_result_discarded",
            EventKind::StageFailed => "stage_failed",
        }
    }
}

/// One audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub case_id: CaseId,
    pub stage: Option<Stage>,
    pub kind: EventKind,
    pub attempt: u32,
    pub outcome: String,
    pub detail: serde_json::Value,
    pub prev_hash: ContentHash,
    pub hash: ContentHash,
}

/// Event content before it is chained
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub case_id: CaseId,
    pub stage: Option<Stage>,
    pub kind: EventKind,
    pub attempt: u32,
    pub outcome: String,
    pub detail: serde_json::Value,
}

impl EventDraft {
    #[must_use]
    pub fn new(case_id: CaseId, kind: EventKind, outcome: impl Into<String>) -> Self {
        Self {
            case_id,
            stage: None,
            kind,
            attempt: 0,
            outcome: outcome.into(),
            detail: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    #[must_use]
    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    #[must_use]
    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Chain verification failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("diagnostics chain broken at event {seq}")]
    IntegrityViolation { seq: u64 },
}

const GENESIS: ContentHash = ContentHash::new([0u8; 32]);

/// Hash-chained event log
#[derive(Debug, Default)]
pub struct DiagnosticsRecorder {
    inner: Mutex<Vec<DiagnosticEvent>>,
}

impl DiagnosticsRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and return its sequence number
    pub fn record(&self, draft: EventDraft) -> u64 {
        let mut guard = self.inner.lock();
        let prev_hash = guard.last().map_or(GENESIS, |e| e.hash);
        let seq = guard.len() as u64;
        let mut event = DiagnosticEvent {
            seq,
            timestamp: Utc::now(),
            case_id: draft.case_id,
            stage: draft.stage,
            kind: draft.kind,
            attempt: draft.attempt,
            outcome: draft.outcome,
            detail: draft.detail,
            prev_hash,
            hash: GENESIS,
        };
        event.hash = compute_hash(&event);
        guard.push(event);
        seq
    }

    /// All events in order
    #[must_use]
    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.inner.lock().clone()
    }

    /// Events for one case in order
    #[must_use]
    pub fn for_case(&self, case_id: CaseId) -> Vec<DiagnosticEvent> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.case_id == case_id)
            .cloned()
            .collect()
    }

    /// Number of events of `kind` for a case
    #[must_use]
    pub fn count(&self, case_id: CaseId, kind: EventKind) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.case_id == case_id && e.kind == kind)
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Verify the hash chain
    ///
    /// # Errors
    /// `IntegrityViolation` at the first event whose link or hash is wrong
    pub fn verify_integrity(&self) -> Result<(), DiagnosticsError> {
        verify_chain(&self.inner.lock())
    }
}

/// Verify a sequence of events, e.g. one exported and re-imported
///
/// # Errors
/// `IntegrityViolation` at the first event whose link or hash is wrong
pub fn verify_chain(events: &[DiagnosticEvent]) -> Result<(), DiagnosticsError> {
    let mut prev = GENESIS;
    for event in events {
        if event.prev_hash != prev || event.hash != compute_hash(event) {
            return Err(DiagnosticsError::IntegrityViolation { seq: event.seq });
        }
        prev = event.hash;
    }
    Ok(())
}

fn compute_hash(event: &DiagnosticEvent) -> ContentHash {
    let detail = canonical_json(&event.detail).unwrap_or_default();
    ContentHash::of_fields([
        event.seq.to_le_bytes().to_vec(),
        event.timestamp.to_rfc3339().into_bytes(),
        event.case_id.to_string().into_bytes(),
        event
            .stage
            .map(|s| s.artifact_name().as_bytes().to_vec())
            .unwrap_or_default(),
        event.kind.as_str().as_bytes().to_vec(),
        event.attempt.to_le_bytes().to_vec(),
        event.outcome.as_bytes().to_vec(),
        detail,
        event.prev_hash.as_bytes().to_vec(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_verifies_and_filters_per_case() {
        let log = DiagnosticsRecorder::new();
        let a = CaseId::new();
        let b = CaseId::new();
        log.record(EventDraft::new(a, EventKind::CaseCreated, "ok"));
        log.record(EventDraft::new(b, EventKind::CaseCreated, "ok"));
        log.record(
            EventDraft::new(a, EventKind::RetrievalAttempt, "2 candidates")
                .stage(Stage::Retrieve)
                .attempt(1)
                .detail(json!({"section": "Scope"})),
        );

        assert_eq!(log.len(), 3);
        assert!(log.verify_integrity().is_ok());
        assert_eq!(log.for_case(a).len(), 2);
        assert_eq!(log.count(a, EventKind::RetrievalAttempt), 1);
        assert_eq!(log.count(b, EventKind::RetrievalAttempt), 0);
    }

    #[test]
    fn tampering_is_detected() {
        let log = DiagnosticsRecorder::new();
        let case = CaseId::new();
        for i in 0..3 {
            log.record(EventDraft::new(case, EventKind::CollaboratorAttempt, "failed").attempt(i));
        }
        let mut events = log.events();
        assert!(verify_chain(&events).is_ok());
        events[1].outcome = "ok".into();
        assert_eq!(verify_chain(&events), Err(DiagnosticsError::IntegrityViolation { seq: 1 }));
    }
}
