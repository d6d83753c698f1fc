//! Stage state machine
//!
//! Forward-only, with two controlled back-edges through `REWORK`:
//! `REVIEWED -> REWORK -> DRAFTED` (re-write) and
//! `REVIEWED -> REWORK -> RETRIEVED` (re-evidence). `PLAN_READY` may be
//! re-entered to produce a new plan version before retrieval.

use crate::case::CaseStage;
use crate::error::PipelineError;
use sow_artifact::Stage;

impl CaseStage {
    /// States reachable in one step
    #[must_use]
    pub fn allowed_next(self) -> &'static [CaseStage] {
        use CaseStage::{Approved, Assembled, Drafted, Init, PlanReady, Retrieved, Reviewed, Rework};
        match self {
            Init => &[PlanReady],
            PlanReady => &[PlanReady, Retrieved],
            Retrieved => &[Assembled],
            Assembled => &[Drafted],
            Drafted => &[Reviewed],
            Reviewed => &[Approved, Rework],
            Rework => &[Drafted, Retrieved],
            Approved => &[],
        }
    }

    /// Whether no further transition exists
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }
}

/// Validate one transition
///
/// # Errors
/// `StageViolation` if `to` is not reachable from `from`
pub fn validate_transition(from: CaseStage, to: CaseStage) -> Result<(), PipelineError> {
    if from.allowed_next().contains(&to) {
        Ok(())
    } else {
        Err(PipelineError::StageViolation { from, to })
    }
}

/// Validate running `stage` from `from`
///
/// Leaving `REWORK` is only allowed into the stage the rework named.
///
/// # Errors
/// `StageViolation` if the stage may not run now
pub fn validate_stage_run(from: CaseStage, stage: Stage, rework_target: Option<Stage>) -> Result<CaseStage, PipelineError> {
    let to = CaseStage::after(stage);
    validate_transition(from, to)?;
    if from == CaseStage::Rework && rework_target != Some(stage) {
        return Err(PipelineError::StageViolation { from, to });
    }
    Ok(to)
}
