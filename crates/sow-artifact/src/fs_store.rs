//! Filesystem artifact store
//!
//! Layout: `<root>/<case_id>/<STAGE>/v<n>.json`, one file per version.
//! A version is written to a temp file in the chain directory, synced, then
//! linked into place without clobbering: only complete files ever carry a
//! version name, and an occupied slot is never overwritten.
//! Supersession is appended to `<root>/<case_id>/<STAGE>/superseded.jsonl`.

use crate::artifact::StageArtifact;
use crate::stage::{ArtifactRef, CaseId, Stage};
use crate::store::{ArtifactStore, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const SUPERSEDED_FILE: &str = "superseded.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct SupersededMark {
    through: u32,
}

/// Artifact store rooted at a directory
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (and create if needed) a store rooted at `root`
    ///
    /// # Errors
    /// Returns error if the directory cannot be created
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Store root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chain_dir(&self, case_id: CaseId, stage: Stage) -> PathBuf {
        self.root
            .join(case_id.to_string())
            .join(stage.artifact_name())
    }

    fn version_path(&self, case_id: CaseId, stage: Stage, version: u32) -> PathBuf {
        self.chain_dir(case_id, stage).join(format!("v{version}.json"))
    }

    async fn versions_on_disk(&self, case_id: CaseId, stage: Stage) -> Result<Vec<u32>, StoreError> {
        let dir = self.chain_dir(case_id, stage);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(version) = parse_version_file(name) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn read_version(
        &self,
        case_id: CaseId,
        stage: Stage,
        version: u32,
    ) -> Result<Option<StageArtifact>, StoreError> {
        let path = self.version_path(case_id, stage, version);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let artifact: StageArtifact = serde_json::from_slice(&bytes)?;
        if !artifact.verify() {
            return Err(StoreError::Integrity { stage, version });
        }
        Ok(Some(artifact))
    }
}

/// Write `bytes` to `path` atomically; `Ok(false)` if the slot is taken
fn publish(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<bool> {
    let mut temp = tempfile::Builder::new()
        .prefix(".pending-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    match temp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

fn parse_version_file(name: &str) -> Option<u32> {
    name.strip_prefix('v')?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn append(&self, artifact: StageArtifact) -> Result<ArtifactRef, StoreError> {
        let case_id = artifact.case_id();
        let stage = artifact.stage();
        let version = artifact.version();
        if !artifact.verify() {
            return Err(StoreError::Integrity { stage, version });
        }

        let head = self.head_version(case_id, stage).await?;
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

        let dir = self.chain_dir(case_id, stage);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.version_path(case_id, stage, version);
        let bytes = serde_json::to_vec_pretty(&artifact)?;

        let published = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || publish(&dir, &path, &bytes))
                .await
                .map_err(std::io::Error::other)??
        };
        if !published {
            let head = self.head_version(case_id, stage).await?;
            return Err(StoreError::VersionConflict {
                case_id,
                stage,
                version,
                head,
            });
        }

        tracing::debug!(case_id = %case_id, stage = %stage, version, path = %path.display(), "artifact written");
        Ok(artifact.reference())
    }

    async fn get(
        &self,
        case_id: CaseId,
        stage: Stage,
        version: u32,
    ) -> Result<Option<StageArtifact>, StoreError> {
        self.read_version(case_id, stage, version).await
    }

    async fn history(&self, case_id: CaseId, stage: Stage) -> Result<Vec<StageArtifact>, StoreError> {
        let mut out = Vec::new();
        for version in self.versions_on_disk(case_id, stage).await? {
            if let Some(artifact) = self.read_version(case_id, stage, version).await? {
                out.push(artifact);
            }
        }
        Ok(out)
    }

    async fn head_version(&self, case_id: CaseId, stage: Stage) -> Result<u32, StoreError> {
        Ok(self
            .versions_on_disk(case_id, stage)
            .await?
            .last()
            .copied()
            .unwrap_or(0))
    }

    async fn superseded(&self, case_id: CaseId, stage: Stage) -> Result<BTreeSet<u32>, StoreError> {
        let path = self.chain_dir(case_id, stage).join(SUPERSEDED_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let through = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<SupersededMark>(line).ok())
            .map(|mark| mark.through)
            .max()
            .unwrap_or(0);

        Ok(self
            .versions_on_disk(case_id, stage)
            .await?
            .into_iter()
            .filter(|v| *v <= through)
            .collect())
    }

    async fn mark_superseded(
        &self,
        case_id: CaseId,
        stage: Stage,
        through: u32,
    ) -> Result<(), StoreError> {
        let dir = self.chain_dir(case_id, stage);
        if tokio::fs::metadata(&dir).await.is_err() {
            return Ok(());
        }
        let line = serde_json::to_string(&SupersededMark { through })?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(SUPERSEDED_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactPayload;
    use crate::stage::IdempotencyKey;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Draft {
        text: String,
    }

    impl ArtifactPayload for Draft {
        const STAGE: Stage = Stage::Write;
    }

    fn draft(case: CaseId, version: u32, text: &str) -> StageArtifact {
        let key = IdempotencyKey::derive(case, Stage::Write, &[], Some(text));
        StageArtifact::seal(case, version, &Draft { text: text.into() }, key, vec![]).unwrap()
    }

    #[test]
    fn version_file_names() {
        assert_eq!(parse_version_file("v12.json"), Some(12));
        assert_eq!(parse_version_file("superseded.jsonl"), None);
        assert_eq!(parse_version_file("v.json"), None);
    }

    #[tokio::test]
    async fn writes_one_file_per_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();
        let case = CaseId::new();

        store.append(draft(case, 1, "one")).await.unwrap();
        store.append(draft(case, 2, "two")).await.unwrap();

        let chain_dir = dir.path().join(case.to_string()).join("DRAFT");
        assert!(chain_dir.join("v1.json").exists());
        assert!(chain_dir.join("v2.json").exists());

        let latest = store.latest(case, Stage::Write).await.unwrap().unwrap();
        assert_eq!(latest.decode::<Draft>().unwrap().text, "two");
    }

    #[tokio::test]
    async fn occupied_slot_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();
        let case = CaseId::new();

        store.append(draft(case, 1, "original")).await.unwrap();
        let err = store.append(draft(case, 1, "replacement")).await.unwrap_err();
        assert!(err.is_version_conflict());

        let stored = store.get(case, Stage::Write, 1).await.unwrap().unwrap();
        assert_eq!(stored.decode::<Draft>().unwrap().text, "original");
    }

    #[tokio::test]
    async fn supersession_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let case = CaseId::new();
        {
            let store = FsArtifactStore::open(dir.path()).await.unwrap();
            store.append(draft(case, 1, "a")).await.unwrap();
            store.mark_superseded(case, Stage::Write, 1).await.unwrap();
            store.append(draft(case, 2, "b")).await.unwrap();
        }

        let reopened = FsArtifactStore::open(dir.path()).await.unwrap();
        let superseded = reopened.superseded(case, Stage::Write).await.unwrap();
        assert_eq!(superseded.into_iter().collect::<Vec<_>>(), vec![1]);
        let latest = reopened.latest(case, Stage::Write).await.unwrap().unwrap();
        assert_eq!(latest.version(), 2);
    }

    #[tokio::test]
    async fn interrupted_write_leaves_chain_usable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();
        let case = CaseId::new();
        store.append(draft(case, 1, "one")).await.unwrap();

        // A crash mid-write leaves only a partial temp file behind
        let chain_dir = dir.path().join(case.to_string()).join("DRAFT");
        std::fs::write(chain_dir.join(".pending-x1y2z3.tmp"), b"{\"case_id\": ").unwrap();

        assert_eq!(store.head_version(case, Stage::Write).await.unwrap(), 1);
        assert_eq!(store.latest(case, Stage::Write).await.unwrap().unwrap().version(), 1);

        store.append(draft(case, 2, "two")).await.unwrap();
        let latest = store.latest(case, Stage::Write).await.unwrap().unwrap();
        assert_eq!(latest.decode::<Draft>().unwrap().text, "two");
        assert_eq!(store.history(case, Stage::Write).await.unwrap().len(), 2);
    }

    #[test]
    fn publish_refuses_an_occupied_slot_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1.json");
        assert!(publish(dir.path(), &path, b"first").unwrap());
        assert!(!publish(dir.path(), &path, b"second").unwrap());

        assert_eq!(std::fs::read(&path).unwrap(), b"first");
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn tampered_file_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path()).await.unwrap();
        let case = CaseId::new();
        store.append(draft(case, 1, "clean")).await.unwrap();

        let path = dir.path().join(case.to_string()).join("DRAFT").join("v1.json");
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("clean", "dirty")).unwrap();

        let result = store.get(case, Stage::Write, 1).await;
        assert!(matches!(result, Err(StoreError::Integrity { version: 1, .. })));
    }
}
