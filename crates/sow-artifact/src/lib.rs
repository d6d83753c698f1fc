//! SOW Artifact System
//!
//! Immutable, versioned stage artifacts and the stores that hold them.
//!
//! # Core Concepts
//!
//! - [`StageArtifact`]: Sealed output of one stage run, checksummed over canonical JSON
//! - [`ArtifactPayload`]: Trait binding a typed payload to the stage that produces it
//! - [`ArtifactStore`]: Append-only `(case, stage, version)` persistence
//! - [`IdempotencyKey`]: Identity of one logical stage invocation
//!
//! # Example
//!
//! ```rust,ignore
//! use sow_artifact::{ArtifactStore, CaseId, IdempotencyKey, MemoryArtifactStore, Stage, StageArtifact};
//!
//! let store = MemoryArtifactStore::new();
//! let key = IdempotencyKey::derive(case_id, Stage::Plan, &[], None);
//! let artifact = StageArtifact::seal(case_id, 1, &plan, key, vec![])?;
//! store.append(artifact).await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod artifact;
mod fs_store;
mod hash;
mod stage;
mod store;

pub use artifact::{ArtifactError, ArtifactPayload, StageArtifact};
pub use fs_store::FsArtifactStore;
pub use hash::{canonical_json, ContentHash, HashError};
pub use stage::{ArtifactRef, CaseId, IdempotencyKey, Stage};
pub use store::{ArtifactStore, MemoryArtifactStore, StoreError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
