//! Append-only artifact stores
//!
//! Writes are keyed by `(case, stage, version)`. A write to an occupied
//! version is rejected with [`StoreError::VersionConflict`]; the writer must
//! re-read the chain head and retry at head + 1. Supersession is recorded
//! beside the chain and never deletes a version.

use crate::artifact::StageArtifact;
use crate::stage::{ArtifactRef, CaseId, IdempotencyKey, Stage};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::fmt::Debug;

/// Errors raised by artifact stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The version slot is already occupied
    #[error("version {version} of {stage} for case {case_id} is already written (head is v{head})")]
    VersionConflict {
        case_id: CaseId,
        stage: Stage,
        version: u32,
        head: u32,
    },

    /// Versions must be dense
    #[error("version gap for {stage}: expected v{expected}, got v{actual}")]
    VersionGap {
        stage: Stage,
        expected: u32,
        actual: u32,
    },

    /// Stored bytes do not match their checksum
    #[error("integrity check failed for {stage} v{version}")]
    Integrity { stage: Stage, version: u32 },

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding failure
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the write lost an optimistic-concurrency race
    #[inline]
    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Versioned, append-only persistence for stage artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync + Debug {
    /// Append an artifact at its declared version
    ///
    /// # Errors
    /// - `VersionConflict` if the version is occupied
    /// - `VersionGap` if the version skips past head + 1
    async fn append(&self, artifact: StageArtifact) -> Result<ArtifactRef, StoreError>;

    /// Read one version
    async fn get(
        &self,
        case_id: CaseId,
        stage: Stage,
        version: u32,
    ) -> Result<Option<StageArtifact>, StoreError>;

    /// All versions of a chain in version order
    async fn history(&self, case_id: CaseId, stage: Stage) -> Result<Vec<StageArtifact>, StoreError>;

    /// Versions marked superseded
    async fn superseded(&self, case_id: CaseId, stage: Stage) -> Result<BTreeSet<u32>, StoreError>;

    /// Mark every version of a chain up to and including `through` superseded
    async fn mark_superseded(
        &self,
        case_id: CaseId,
        stage: Stage,
        through: u32,
    ) -> Result<(), StoreError>;

    /// Highest written version (0 when the chain is empty)
    async fn head_version(&self, case_id: CaseId, stage: Stage) -> Result<u32, StoreError> {
        Ok(self
            .history(case_id, stage)
            .await?
            .last()
            .map_or(0, StageArtifact::version))
    }

    /// Current view: the newest version that is not superseded
    async fn latest(&self, case_id: CaseId, stage: Stage) -> Result<Option<StageArtifact>, StoreError> {
        let superseded = self.superseded(case_id, stage).await?;
        Ok(self
            .history(case_id, stage)
            .await?
            .into_iter()
            .rev()
            .find(|a| !superseded.contains(&a.version())))
    }

    /// Current artifact produced by the given invocation key, if any
    async fn find_by_key(
        &self,
        case_id: CaseId,
        stage: Stage,
        key: &IdempotencyKey,
    ) -> Result<Option<StageArtifact>, StoreError> {
        let superseded = self.superseded(case_id, stage).await?;
        Ok(self
            .history(case_id, stage)
            .await?
            .into_iter()
            .rev()
            .find(|a| a.idempotency_key() == key && !superseded.contains(&a.version())))
    }
}

#[derive(Debug, Default)]
struct Chain {
    versions: Vec<StageArtifact>,
    superseded: BTreeSet<u32>,
}

/// In-process artifact store
///
/// Each `(case, stage)` chain lives behind its own map shard, so appends to
/// different chains never contend.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    chains: DashMap<(CaseId, Stage), Chain>,
}

impl MemoryArtifactStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chains held
    #[inline]
    #[must_use]
    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn append(&self, artifact: StageArtifact) -> Result<ArtifactRef, StoreError> {
        let case_id = artifact.case_id();
        let stage = artifact.stage();
        let version = artifact.version();
        if !artifact.verify() {
            return Err(StoreError::Integrity { stage, version });
        }

        let mut chain = self.chains.entry((case_id, stage)).or_default();
        let head = u32::try_from(chain.versions.len()).unwrap_or(u32::MAX);
        if version <= head {
            return Err(StoreError::VersionConflict {
                case_id,
                stage,
                version,
                head,
            });
        }
        if version != head + 1 {
            return Err(StoreError::VersionGap {
                stage,
                expected: head + 1,
                actual: version,
            });
        }

        let reference = artifact.reference();
        chain.versions.push(artifact);
        tracing::debug!(case_id = %case_id, stage = %stage, version, "artifact appended");
        Ok(reference)
    }

    async fn get(
        &self,
        case_id: CaseId,
        stage: Stage,
        version: u32,
    ) -> Result<Option<StageArtifact>, StoreError> {
        Ok(self.chains.get(&(case_id, stage)).and_then(|chain| {
            chain
                .versions
                .iter()
                .find(|a| a.version() == version)
                .cloned()
        }))
    }

    async fn history(&self, case_id: CaseId, stage: Stage) -> Result<Vec<StageArtifact>, StoreError> {
        Ok(self
            .chains
            .get(&(case_id, stage))
            .map(|chain| chain.versions.clone())
            .unwrap_or_default())
    }

    async fn superseded(&self, case_id: CaseId, stage: Stage) -> Result<BTreeSet<u32>, StoreError> {
        Ok(self
            .chains
            .get(&(case_id, stage))
            .map(|chain| chain.superseded.clone())
            .unwrap_or_default())
    }

    async fn mark_superseded(
        &self,
        case_id: CaseId,
        stage: Stage,
        through: u32,
    ) -> Result<(), StoreError> {
        if let Some(mut chain) = self.chains.get_mut(&(case_id, stage)) {
            let versions: Vec<u32> = chain
                .versions
                .iter()
                .map(StageArtifact::version)
                .filter(|v| *v <= through)
                .collect();
            chain.superseded.extend(versions);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactPayload;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Blob {
        body: String,
    }

    impl ArtifactPayload for Blob {
        const STAGE: Stage = Stage::Retrieve;
    }

    fn artifact(case: CaseId, version: u32, body: &str, token: &str) -> StageArtifact {
        let key = IdempotencyKey::derive(case, Stage::Retrieve, &[], Some(token));
        StageArtifact::seal(case, version, &Blob { body: body.into() }, key, vec![]).unwrap()
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let store = MemoryArtifactStore::new();
        let case = CaseId::new();
        store.append(artifact(case, 1, "a", "k1")).await.unwrap();
        store.append(artifact(case, 2, "b", "k2")).await.unwrap();

        assert_eq!(store.head_version(case, Stage::Retrieve).await.unwrap(), 2);
        let latest = store.latest(case, Stage::Retrieve).await.unwrap().unwrap();
        assert_eq!(latest.version(), 2);
        assert_eq!(store.history(case, Stage::Retrieve).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rewriting_a_version_is_a_conflict_and_keeps_first_content() {
        let store = MemoryArtifactStore::new();
        let case = CaseId::new();
        let first = artifact(case, 1, "first", "k1");
        store.append(first.clone()).await.unwrap();

        let result = store.append(artifact(case, 1, "second", "k2")).await;
        assert!(matches!(
            result,
            Err(StoreError::VersionConflict { version: 1, head: 1, .. })
        ));

        let stored = store.get(case, Stage::Retrieve, 1).await.unwrap().unwrap();
        assert_eq!(stored.checksum(), first.checksum());
    }

    #[tokio::test]
    async fn gaps_are_rejected() {
        let store = MemoryArtifactStore::new();
        let case = CaseId::new();
        let result = store.append(artifact(case, 2, "x", "k")).await;
        assert!(matches!(
            result,
            Err(StoreError::VersionGap { expected: 1, actual: 2, .. })
        ));
    }

    #[tokio::test]
    async fn superseded_versions_leave_the_current_view() {
        let store = MemoryArtifactStore::new();
        let case = CaseId::new();
        store.append(artifact(case, 1, "a", "k1")).await.unwrap();
        store.mark_superseded(case, Stage::Retrieve, 1).await.unwrap();

        assert!(store.latest(case, Stage::Retrieve).await.unwrap().is_none());
        assert!(store.get(case, Stage::Retrieve, 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn find_by_key_skips_superseded() {
        let store = MemoryArtifactStore::new();
        let case = CaseId::new();
        let a = artifact(case, 1, "a", "same");
        let key = *a.idempotency_key();
        store.append(a).await.unwrap();

        assert!(store
            .find_by_key(case, Stage::Retrieve, &key)
            .await
            .unwrap()
            .is_some());

        store.mark_superseded(case, Stage::Retrieve, 1).await.unwrap();
        assert!(store
            .find_by_key(case, Stage::Retrieve, &key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn concurrent_writers_for_one_slot_admit_exactly_one() {
        let store = std::sync::Arc::new(MemoryArtifactStore::new());
        let case = CaseId::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(artifact(case, 1, &format!("w{i}"), &format!("k{i}")))
                    .await
                    .is_ok()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
