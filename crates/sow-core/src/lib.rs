//! SOW Core - stage orchestration for grounded SOW synthesis
//!
//! The orchestrator that:
//! - Validates intake and drives the PLAN → RETRIEVE → ASSEMBLE → WRITE → REVIEW chain
//! - Enforces the stage state machine, the plan lock and every review gate
//! - Calls planner, writer and reviewer capabilities under bounded retry
//! - Persists each stage as an immutable, versioned, lineage-linked artifact
//! - Records a hash-chained diagnostics log per case
//!
//! # Example
//!
//! ```rust,ignore
//! use sow_core::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let orch = Orchestrator::new(config, store, knowledge, Arc::new(TaxonomyPlanner), Arc::new(ExtractiveWriter))?;
//! let case = orch.create_case(intake, "sow");
//!
//! let plan = orch.run_plan(case, None).await?;
//! orch.lock_plan(case, plan.version(), "pm@acme").await?;
//! orch.run_retrieve(case).await?;
//! orch.run_assemble(case).await?;
//! orch.run_write(case).await?;
//! orch.run_review(case).await?;
//! orch.approve(case, "legal@acme").await?;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod case;
pub mod collaborator;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod intake;
pub mod orchestrator;
pub mod payloads;
pub mod pool;
pub mod render;
pub mod state_machine;
pub mod writers;

// Re-exports for convenience
pub use case::{Case, CaseStage, Override, OverrideTarget, PlanLock};
pub use collaborator::{
    PlanRequest, PlanResponse, Planner, ReviewRequest, Reviewer, TaxonomyPlanner, WriteRequest, Writer,
};
pub use config::PipelineConfig;
pub use diagnostics::{verify_chain, DiagnosticEvent, DiagnosticsError, DiagnosticsRecorder, EventDraft, EventKind};
pub use error::{
    CollaboratorError, ErrorKind, ErrorReport, EvidenceShortfall, PipelineError, PlanError, RemediationHint,
};
pub use intake::{ClientProfile, Intake, IntakeContext};
pub use orchestrator::Orchestrator;
pub use payloads::{BlueprintSet, DraftSet, Plan, RetrievalSet, ReviewReport};
pub use pool::{PoolStats, SectionPool};
pub use render::render_markdown;
pub use state_machine::{validate_stage_run, validate_transition};
pub use writers::{ExtractiveWriter, TemplateWriter};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running a case
    pub use crate::{
        CaseStage, ExtractiveWriter, Intake, Orchestrator, OverrideTarget, PipelineConfig, PipelineError,
        TaxonomyPlanner,
    };
    pub use sow_artifact::{ArtifactStore, CaseId, MemoryArtifactStore, Stage};
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
