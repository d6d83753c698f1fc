//! SOW Retrieval Engine
//!
//! Section-scoped evidence retrieval with deterministic low-recall fallback.
//!
//! # Core Concepts
//!
//! - [`SectionSpec`]: Planned section with its filters and fallback policy
//! - [`RetrievalEngine`]: Strict query first, then cumulative relaxation
//! - [`Normalizer`] / [`dedupe`]: Raw hits to provenance-tagged [`ClauseCandidate`]s
//! - [`ConflictRuleTable`]: Pairwise conflict flags, never resolution
//! - [`assemble_blueprint`]: Ordered primary/alternative clause arrangement
//! - [`RetryPolicy`]: Bounded retry with backoff and per-call timeout
//!
//! # Example
//!
//! ```rust,ignore
//! use sow_retrieval::{LocalCorpus, RetrievalContext, RetrievalEngine, SectionSpec};
//!
//! let corpus = LocalCorpus::from_jsonl_file("kb_chunks.jsonl").await?;
//! let engine = RetrievalEngine::new(Arc::new(corpus));
//! let out = engine.retrieve(&SectionSpec::new("Scope", "deliverables"), &RetrievalContext::new()).await?;
//! println!("{} attempts", out.diagnostics.attempts.len());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod blueprint;
mod candidate;
mod conflict;
mod corpus;
mod dedup;
mod engine;
mod error;
mod filters;
mod knowledge;
mod normalize;
mod retry;
mod section;

pub use blueprint::{assemble_blueprint, BlueprintEntry, ClauseRole, SectionBlueprint};
pub use candidate::ClauseCandidate;
pub use conflict::{Conflict, ConflictCheck, ConflictRule, ConflictRuleTable};
pub use corpus::{validate_kb, KbIssue, KbReport, LocalCorpus, MIN_TAGS, REQUIRED_METADATA_KEYS};
pub use dedup::{dedupe, fingerprint, normalize_text};
pub use engine::{
    build_strict_query, relaxation_plan, EvidenceStatus, QueryAttempt, RetrievalDiagnostics,
    RetrievalEngine, SectionRetrieval,
};
pub use error::{CorpusError, KnowledgeError, RetrievalError};
pub use filters::{
    intake_template_field, FilterDimension, FilterSet, FilterValue, RetrievalContext,
    RetrievalQuery, RiskLevel,
};
pub use knowledge::{ChunkMetadata, KnowledgeCapability, KnowledgeHit};
pub use normalize::{extract_text, DiscardReason, Normalized, Normalizer};
pub use retry::{AttemptFailure, Attempted, RetryError, RetryPolicy, Transient};
pub use section::{FallbackPolicy, MinContent, SectionCategory, SectionSpec};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
