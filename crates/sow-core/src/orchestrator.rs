//! Stage orchestrator
//!
//! Drives a case through PLAN → RETRIEVE → ASSEMBLE → WRITE → REVIEW and
//! approval. Every stage run follows the same protocol:
//!
//! 1. Snapshot the case and resolve the current input artifacts
//! 2. Derive the idempotency key; a current artifact with that key is
//!    returned as-is and no collaborator is called
//! 3. Validate the transition and the stage gate
//! 4. Call collaborators under their retry budgets
//! 5. Append the artifact at head + 1 (one re-read-and-reapply on a lost race)
//! 6. Supersede stale versions and downstream chains, then advance the case
//!
//! Nothing is persisted when a step before 5 fails, so a failed run leaves
//! the case in its prior stable state. No lock is held across a stage run.

use crate::case::{Case, CaseStage, Override, OverrideTarget, PlanLock};
use crate::collaborator::{PlanRequest, Planner, ReviewRequest, Reviewer, WriteRequest, Writer};
use crate::config::PipelineConfig;
use crate::diagnostics::{DiagnosticEvent, DiagnosticsRecorder, EventDraft, EventKind};
use crate::error::{CollaboratorError, EvidenceShortfall, PipelineError, RemediationHint};
use crate::intake::Intake;
use crate::payloads::{BlueprintSet, DraftSet, Plan, RetrievalSet, ReviewReport};
use crate::pool::{PoolStats, SectionPool};
use crate::render;
use crate::state_machine::{validate_stage_run, validate_transition};
use crate::writers::TemplateWriter;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use sow_artifact::{
    ArtifactError, ArtifactPayload, ArtifactRef, ArtifactStore, CaseId, ContentHash, IdempotencyKey, Stage,
    StageArtifact,
};
use sow_retrieval::{
    assemble_blueprint, AttemptFailure, EvidenceStatus, KnowledgeCapability, Normalizer, RetrievalEngine,
    RetryError, RetryPolicy, SectionBlueprint, SectionSpec,
};
use sow_review::{sort_findings, Draft, DraftSection, Finding, GroundingValidator, ReviewInput};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Case orchestrator
pub struct Orchestrator {
    config: PipelineConfig,
    store: Arc<dyn ArtifactStore>,
    cases: DashMap<CaseId, Case>,
    planner: Arc<dyn Planner>,
    engine: RetrievalEngine,
    writer: Arc<dyn Writer>,
    reviewer: Option<Arc<dyn Reviewer>>,
    validator: GroundingValidator,
    pool: SectionPool,
    diagnostics: Arc<DiagnosticsRecorder>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("cases", &self.cases.len())
            .field("engine", &self.engine)
            .field("pool", &self.pool)
            .field("reviewer", &self.reviewer.is_some())
            .finish_non_exhaustive()
    }
}

fn required(value: &str, field: &str, fields: &mut Vec<String>) {
    if value.trim().is_empty() {
        fields.push(field.to_string());
    }
}

fn validation(message: &str, fields: Vec<String>) -> Result<(), PipelineError> {
    if fields.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Validation {
            message: message.to_string(),
            fields,
        })
    }
}

fn collaborator_failure(
    stage: Stage,
    collaborator: &str,
    error: RetryError<CollaboratorError>,
    artifact_version: Option<u32>,
) -> PipelineError {
    let (attempts, message) = match error {
        RetryError::Exhausted { attempts, last } => (attempts, last),
        RetryError::Permanent { attempts, error } => (attempts, error.to_string()),
    };
    PipelineError::CollaboratorFailure {
        stage,
        collaborator: collaborator.to_string(),
        attempts,
        message,
        artifact_version,
    }
}

impl Orchestrator {
    /// Build an orchestrator
    ///
    /// # Errors
    /// `Config` if the review policy does not compile
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ArtifactStore>,
        knowledge: Arc<dyn KnowledgeCapability>,
        planner: Arc<dyn Planner>,
        writer: Arc<dyn Writer>,
    ) -> Result<Self, PipelineError> {
        let validator = GroundingValidator::new(config.review.clone()).map_err(|e| PipelineError::Config(e.to_string()))?;
        let engine = RetrievalEngine::new(knowledge)
            .with_retry(config.knowledge_retry)
            .with_top_k(config.top_k)
            .with_min_candidates(config.min_candidates)
            .with_normalizer(Normalizer::new(config.min_clause_chars));
        Ok(Self {
            pool: SectionPool::new(config.max_concurrent_sections),
            config,
            store,
            cases: DashMap::new(),
            planner,
            engine,
            writer,
            reviewer: None,
            validator,
            diagnostics: Arc::new(DiagnosticsRecorder::new()),
        })
    }

    /// Add a reviewer whose findings are unioned with the deterministic checks
    #[must_use]
    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    #[must_use]
    pub fn recorder(&self) -> &Arc<DiagnosticsRecorder> {
        &self.diagnostics
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // ------------------------------------------------------------------
    // Case surface
    // ------------------------------------------------------------------

    /// Open a case in `INIT`
    ///
    /// The intake is validated when the plan runs, so a partial intake can
    /// be stored and completed later.
    pub fn create_case(&self, intake: Intake, document_type: impl Into<String>) -> CaseId {
        let case = Case::new(intake, document_type);
        let id = case.id;
        info!(case_id = %id, document_type = %case.document_type, "case created");
        self.diagnostics.record(
            EventDraft::new(id, EventKind::CaseCreated, "ok").detail(json!({ "document_type": case.document_type })),
        );
        self.cases.insert(id, case);
        id
    }

    /// Produce a PLAN version
    ///
    /// `request_token` distinguishes deliberate re-plans of an unchanged
    /// intake; the same token replays the same plan.
    ///
    /// # Errors
    /// `Validation` listing every missing intake field, `StageViolation`,
    /// or `CollaboratorFailure` once the planner budget is spent
    pub async fn run_plan(&self, case_id: CaseId, request_token: Option<&str>) -> Result<StageArtifact, PipelineError> {
        let result = self.plan_stage(case_id, request_token).await;
        self.observe(case_id, Stage::Plan, result)
    }

    /// Approve one PLAN version for retrieval
    ///
    /// # Errors
    /// `Validation` for a blank approver, `Precondition` if `version` is not
    /// the current plan or the case is past planning
    pub async fn lock_plan(&self, case_id: CaseId, version: u32, approver: &str) -> Result<PlanLock, PipelineError> {
        let result = self.lock_plan_inner(case_id, version, approver).await;
        self.observe(case_id, Stage::Plan, result)
    }

    /// Retrieve candidates for every evidence section of the locked plan
    ///
    /// # Errors
    /// `Precondition` without a locked current plan, `CollaboratorFailure`
    /// when the knowledge capability stays unavailable
    pub async fn run_retrieve(&self, case_id: CaseId) -> Result<StageArtifact, PipelineError> {
        let result = self.retrieve_stage(case_id).await;
        self.observe(case_id, Stage::Retrieve, result)
    }

    /// Arrange candidates into blueprints
    ///
    /// # Errors
    /// `InsufficientEvidence` for mandatory sections below the coverage
    /// threshold without an evidence override
    pub async fn run_assemble(&self, case_id: CaseId) -> Result<StageArtifact, PipelineError> {
        let result = self.assemble_stage(case_id).await;
        self.observe(case_id, Stage::Assemble, result)
    }

    /// Draft every planned section
    ///
    /// # Errors
    /// `Precondition` while any blueprint conflict lacks an override,
    /// `CollaboratorFailure` once the writer budget is spent
    pub async fn run_write(&self, case_id: CaseId) -> Result<StageArtifact, PipelineError> {
        let result = self.write_stage(case_id).await;
        self.observe(case_id, Stage::Write, result)
    }

    /// Review the current draft
    ///
    /// # Errors
    /// `Precondition` while a mandatory section is missing or empty
    pub async fn run_review(&self, case_id: CaseId) -> Result<StageArtifact, PipelineError> {
        let result = self.review_stage(case_id).await;
        self.observe(case_id, Stage::Review, result)
    }

    /// Approve a reviewed case
    ///
    /// # Errors
    /// `StageViolation` outside `REVIEWED`, `Precondition` while a critical
    /// finding lacks an override
    pub async fn approve(&self, case_id: CaseId, approver: &str) -> Result<Case, PipelineError> {
        let result = self.approve_inner(case_id, approver).await;
        self.observe(case_id, Stage::Review, result)
    }

    /// Send a reviewed case back to WRITE or RETRIEVE
    ///
    /// The target chain and everything downstream of it leave the current
    /// view, so the re-run produces new versions.
    ///
    /// # Errors
    /// `Validation` for another target or a blank reason, `StageViolation`
    /// outside `REVIEWED`
    pub async fn rework(&self, case_id: CaseId, target: Stage, reason: &str) -> Result<Case, PipelineError> {
        let result = self.rework_inner(case_id, target, reason).await;
        self.observe(case_id, target, result)
    }

    /// Cancel a case between stages
    ///
    /// A stage already running finishes, but its artifact is superseded on
    /// arrival and the run reports `Cancelled`.
    ///
    /// # Errors
    /// `UnknownCase`, or `Precondition` for an approved case
    pub fn cancel(&self, case_id: CaseId, reason: &str) -> Result<Case, PipelineError> {
        let case = self.case(case_id)?;
        if case.cancelled {
            return Ok(case);
        }
        if case.stage == CaseStage::Approved {
            return Err(PipelineError::precondition(
                Stage::Review,
                case.stage,
                "an approved case cannot be cancelled",
            ));
        }
        let case = self.update_case(case_id, |c| {
            c.cancelled = true;
            c.clone()
        })?;
        warn!(case_id = %case_id, stage = %case.stage, reason, "case cancelled");
        self.diagnostics.record(
            EventDraft::new(case_id, EventKind::Cancelled, "cancelled").detail(json!({ "reason": reason, "stage": case.stage })),
        );
        Ok(case)
    }

    /// Attach an attributed override to a gate
    ///
    /// # Errors
    /// `Validation` for a blank reason or approver
    pub fn add_override(
        &self,
        case_id: CaseId,
        target: OverrideTarget,
        reason: &str,
        approver: &str,
    ) -> Result<Override, PipelineError> {
        let mut fields = Vec::new();
        required(reason, "reason", &mut fields);
        required(approver, "approver", &mut fields);
        validation("override needs a reason and an approver", fields)?;
        self.active_case(case_id)?;

        let value = Override {
            target: target.clone(),
            reason: reason.to_string(),
            approver: approver.to_string(),
            at: Utc::now(),
        };
        self.update_case(case_id, |c| c.add_override(value.clone()))?;
        info!(case_id = %case_id, target = %target, approver, "override added");
        self.diagnostics.record(
            EventDraft::new(case_id, EventKind::OverrideAdded, target.to_string())
                .detail(json!({ "reason": reason, "approver": approver })),
        );
        Ok(value)
    }

    /// Snapshot of a case
    ///
    /// # Errors
    /// `UnknownCase`
    pub fn get_case(&self, case_id: CaseId) -> Result<Case, PipelineError> {
        self.case(case_id)
    }

    /// One artifact version, or the current one
    ///
    /// # Errors
    /// `UnknownCase` or a store failure
    pub async fn get_artifact(
        &self,
        case_id: CaseId,
        stage: Stage,
        version: Option<u32>,
    ) -> Result<Option<StageArtifact>, PipelineError> {
        self.case(case_id)?;
        let artifact = match version {
            Some(version) => self.store.get(case_id, stage, version).await?,
            None => self.store.latest(case_id, stage).await?,
        };
        Ok(artifact)
    }

    /// Markdown view of the current draft
    ///
    /// # Errors
    /// `Precondition` if the case has no current draft
    pub async fn render_markdown(&self, case_id: CaseId) -> Result<String, PipelineError> {
        let case = self.case(case_id)?;
        let (_, drafts) = self.current::<DraftSet>(&case, Stage::Write, Stage::Write, "run_write").await?;
        Ok(render::render_markdown(&case.intake, &drafts.draft))
    }

    /// Diagnostics events for a case, in order
    #[must_use]
    pub fn diagnostics(&self, case_id: CaseId) -> Vec<DiagnosticEvent> {
        self.diagnostics.for_case(case_id)
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    async fn plan_stage(&self, case_id: CaseId, request_token: Option<&str>) -> Result<StageArtifact, PipelineError> {
        let case = self.active_case(case_id)?;
        case.intake.validate()?;

        let intake_hash = ContentHash::of_payload(&case.intake).map_err(ArtifactError::from)?;
        let token = format!(
            "{intake_hash}:{}:{}",
            case.document_type,
            request_token.unwrap_or_default()
        );
        let key = IdempotencyKey::derive(case_id, Stage::Plan, &[], Some(token.as_str()));
        if let Some(existing) = self.replay(&case, Stage::Plan, &key).await? {
            return Ok(existing);
        }
        validate_stage_run(case.stage, Stage::Plan, case.rework_target)?;
        info!(case_id = %case_id, stage = %Stage::Plan, "stage started");

        let taxonomy = self.config.taxonomy_for(&case.document_type);
        let feedback = Mutex::new(None::<String>);
        let planner = &self.planner;
        let intake = &case.intake;
        let plan = self
            .call_collaborator(
                case_id,
                Stage::Plan,
                "planner",
                self.config.planner_retry,
                None,
                Some(&feedback),
                |attempt| {
                    let request = PlanRequest {
                        intake: intake.clone(),
                        document_type: case.document_type.clone(),
                        taxonomy: taxonomy.clone(),
                        risk_matrix: self.config.risk_matrix.clone(),
                        attempt,
                        feedback: feedback.lock().clone(),
                    };
                    async move {
                        let response = planner.plan(&request).await?;
                        let plan = Plan {
                            document_type: request.document_type,
                            sections: response.sections,
                            validation_rules: response.validation_rules,
                        }
                        .resolve(&request.intake);
                        plan.check()?;
                        Ok::<Plan, CollaboratorError>(plan)
                    }
                },
            )
            .await?;

        debug!(case_id = %case_id, sections = plan.sections.len(), "plan accepted");
        self.commit_and_finish(case_id, &plan, key, Vec::new()).await
    }

    async fn lock_plan_inner(&self, case_id: CaseId, version: u32, approver: &str) -> Result<PlanLock, PipelineError> {
        let mut fields = Vec::new();
        required(approver, "approver", &mut fields);
        validation("plan lock needs an approver", fields)?;

        let case = self.active_case(case_id)?;
        if case.stage != CaseStage::PlanReady {
            return Err(PipelineError::precondition(
                Stage::Plan,
                case.stage,
                format!("plans can only be locked in {}", CaseStage::PlanReady),
            ));
        }
        let current = self.store.latest(case_id, Stage::Plan).await?.map(|a| a.version());
        if current != Some(version) {
            return Err(PipelineError::Precondition {
                stage: Stage::Plan,
                reason: format!("PLAN v{version} is not the current plan"),
                current: case.stage,
                artifact_version: Some(version),
                items: Vec::new(),
                hints: current
                    .map(|v| vec![RemediationHint::new("lock_plan", "PLAN", format!("lock the current PLAN v{v}"))])
                    .unwrap_or_default(),
            });
        }

        let lock = PlanLock {
            version,
            approver: approver.to_string(),
            at: Utc::now(),
        };
        self.update_case(case_id, |c| c.plan_lock = Some(lock.clone()))?;
        info!(case_id = %case_id, version, approver, "plan locked");
        self.diagnostics.record(
            EventDraft::new(case_id, EventKind::PlanLocked, format!("v{version}"))
                .stage(Stage::Plan)
                .detail(json!({ "approver": approver })),
        );
        Ok(lock)
    }

    async fn retrieve_stage(&self, case_id: CaseId) -> Result<StageArtifact, PipelineError> {
        let case = self.active_case(case_id)?;
        let (plan_artifact, plan) = self.current::<Plan>(&case, Stage::Plan, Stage::Retrieve, "run_plan").await?;
        let plan_version = plan_artifact.version();
        if case.plan_lock.as_ref().map(|l| l.version) != Some(plan_version) {
            return Err(PipelineError::Precondition {
                stage: Stage::Retrieve,
                reason: format!("PLAN v{plan_version} is not locked"),
                current: case.stage,
                artifact_version: Some(plan_version),
                items: Vec::new(),
                hints: vec![RemediationHint::new(
                    "lock_plan",
                    "PLAN",
                    format!("approve PLAN v{plan_version} before retrieval"),
                )],
            });
        }

        let inputs = vec![plan_artifact.reference()];
        let key = IdempotencyKey::derive(case_id, Stage::Retrieve, &inputs, None);
        if let Some(existing) = self.replay(&case, Stage::Retrieve, &key).await? {
            return Ok(existing);
        }
        validate_stage_run(case.stage, Stage::Retrieve, case.rework_target)?;
        info!(case_id = %case_id, stage = %Stage::Retrieve, plan_version, "stage started");

        let context = case.intake.retrieval_context();
        let engine = &self.engine;
        let context = &context;
        let jobs: Vec<(String, SectionSpec)> = plan
            .sections
            .iter()
            .filter(|s| s.needs_evidence())
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        let results = self
            .pool
            .run(jobs, |_, spec| async move { engine.retrieve(&spec, context).await })
            .await;

        for retrieval in results.iter().filter_map(|(_, r)| r.as_ref().ok()) {
            for attempt in &retrieval.diagnostics.attempts {
                self.diagnostics.record(
                    EventDraft::new(case_id, EventKind::RetrievalAttempt, format!("{} candidates", attempt.deduped_count))
                        .stage(Stage::Retrieve)
                        .attempt(attempt.attempt)
                        .detail(json!({
                            "section": retrieval.section,
                            "filters": attempt.query.filters,
                            "relaxed": attempt.relaxed,
                            "raw_count": attempt.raw_count,
                            "discarded": attempt.discarded,
                            "deduped_count": attempt.deduped_count,
                            "transport_attempts": attempt.transport_attempts,
                        })),
                );
            }
            if retrieval.status != EvidenceStatus::Satisfied {
                warn!(case_id = %case_id, section = %retrieval.section, status = ?retrieval.status, "section below evidence minimum");
            }
        }

        let sections = results
            .into_iter()
            .map(|(_, r)| r)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PipelineError::from_retrieval(e, plan_version))?;

        self.commit_and_finish(case_id, &RetrievalSet { sections }, key, inputs).await
    }

    async fn assemble_stage(&self, case_id: CaseId) -> Result<StageArtifact, PipelineError> {
        let case = self.active_case(case_id)?;
        let (retrieval_artifact, retrieval) = self
            .current::<RetrievalSet>(&case, Stage::Retrieve, Stage::Assemble, "run_retrieve")
            .await?;
        let (plan_ref, plan) = self.input::<Plan>(&retrieval_artifact, Stage::Plan).await?;

        let inputs = vec![retrieval_artifact.reference(), plan_ref];
        let key = IdempotencyKey::derive(case_id, Stage::Assemble, &inputs, None);
        if let Some(existing) = self.replay(&case, Stage::Assemble, &key).await? {
            return Ok(existing);
        }
        validate_stage_run(case.stage, Stage::Assemble, case.rework_target)?;
        info!(case_id = %case_id, stage = %Stage::Assemble, "stage started");

        let blueprints: Vec<SectionBlueprint> = plan
            .sections
            .iter()
            .map(|spec| {
                let candidates = if spec.needs_evidence() {
                    retrieval.section(&spec.name).map_or(&[][..], |s| s.candidates.as_slice())
                } else {
                    &[]
                };
                assemble_blueprint(spec, candidates, &self.config.conflict_rules, self.config.primary_per_section)
            })
            .collect();

        // Coverage gate
        let required = self.config.min_primary_clauses;
        let shortfalls: Vec<EvidenceShortfall> = plan
            .sections
            .iter()
            .zip(&blueprints)
            .filter(|(spec, blueprint)| {
                spec.needs_evidence()
                    && spec.mandatory
                    && blueprint.primary_count() < required
                    && !case.is_overridden(&OverrideTarget::Evidence {
                        section: spec.name.clone(),
                    })
            })
            .map(|(spec, blueprint)| EvidenceShortfall {
                section: spec.name.clone(),
                found: blueprint.primary_count(),
                required,
                remaining_filters: retrieval
                    .section(&spec.name)
                    .and_then(|s| s.diagnostics.attempts.last())
                    .map(|a| a.query.filters.dimensions())
                    .unwrap_or_default(),
            })
            .collect();
        if !shortfalls.is_empty() {
            return Err(PipelineError::InsufficientEvidence {
                sections: shortfalls,
                artifact_version: Some(retrieval_artifact.version()),
            });
        }

        let conflicts: usize = blueprints.iter().map(|b| b.conflicts.len()).sum();
        if conflicts > 0 {
            warn!(case_id = %case_id, conflicts, "blueprint conflicts flagged");
        }
        self.commit_and_finish(case_id, &BlueprintSet { sections: blueprints }, key, inputs)
            .await
    }

    async fn write_stage(&self, case_id: CaseId) -> Result<StageArtifact, PipelineError> {
        let case = self.active_case(case_id)?;
        let (blueprint_artifact, blueprints) = self
            .current::<BlueprintSet>(&case, Stage::Assemble, Stage::Write, "run_assemble")
            .await?;
        let (plan_ref, plan) = self.input::<Plan>(&blueprint_artifact, Stage::Plan).await?;

        let inputs = vec![blueprint_artifact.reference(), plan_ref];
        let key = IdempotencyKey::derive(case_id, Stage::Write, &inputs, None);
        if let Some(existing) = self.replay(&case, Stage::Write, &key).await? {
            return Ok(existing);
        }
        validate_stage_run(case.stage, Stage::Write, case.rework_target)?;

        // Conflict gate
        let mut items = Vec::new();
        let mut hints = Vec::new();
        for blueprint in &blueprints.sections {
            for conflict in &blueprint.conflicts {
                let target = OverrideTarget::Conflict {
                    section: blueprint.section.clone(),
                    left: conflict.left.clone(),
                    right: conflict.right.clone(),
                };
                if !case.is_overridden(&target) {
                    items.push(format!(
                        "{}: {} <> {} ({})",
                        blueprint.section, conflict.left, conflict.right, conflict.reason
                    ));
                    hints.push(RemediationHint::new("add_override", target.to_string(), conflict.reason.clone()));
                }
            }
        }
        if !items.is_empty() {
            return Err(PipelineError::Precondition {
                stage: Stage::Write,
                reason: format!("{} unresolved clause conflict(s)", items.len()),
                current: case.stage,
                artifact_version: Some(blueprint_artifact.version()),
                items,
                hints,
            });
        }
        info!(case_id = %case_id, stage = %Stage::Write, "stage started");

        let version = blueprint_artifact.version();
        let intake = &case.intake;
        let blueprints = &blueprints;
        let jobs: Vec<(String, SectionSpec)> = plan.sections.iter().map(|s| (s.name.clone(), s.clone())).collect();
        let results = self
            .pool
            .run(jobs, |name, spec| {
                let blueprint = blueprints.section(&name).cloned();
                async move { self.draft_section(case_id, intake, spec, blueprint, version).await }
            })
            .await;

        let mut by_name: BTreeMap<String, Result<DraftSection, PipelineError>> = results.into_iter().collect();
        let sections = plan
            .sections
            .iter()
            .map(|spec| {
                by_name.remove(&spec.name).unwrap_or_else(|| {
                    Err(PipelineError::Artifact(ArtifactError::InvariantViolation(format!(
                        "no draft produced for '{}'",
                        spec.name
                    ))))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let needs_input = sections.iter().filter(|s| s.is_empty()).count();
        if needs_input > 0 {
            warn!(case_id = %case_id, needs_input, "sections returned NEEDS_INPUT");
        }
        let draft = DraftSet {
            draft: Draft { sections },
        };
        self.commit_and_finish(case_id, &draft, key, inputs).await
    }

    async fn draft_section(
        &self,
        case_id: CaseId,
        intake: &Intake,
        spec: SectionSpec,
        blueprint: Option<SectionBlueprint>,
        blueprint_version: u32,
    ) -> Result<DraftSection, PipelineError> {
        if !spec.needs_evidence() {
            return Ok(TemplateWriter.fill(&spec, intake));
        }
        let blueprint = blueprint.unwrap_or_else(|| {
            assemble_blueprint(&spec, &[], &self.config.conflict_rules, self.config.primary_per_section)
        });
        let writer = &self.writer;
        let expected = spec.name.as_str();
        let category = spec.category;
        self.call_collaborator(
            case_id,
            Stage::Write,
            "writer",
            self.config.writer_retry,
            Some(blueprint_version),
            None,
            |attempt| {
                let request = WriteRequest {
                    section: spec.clone(),
                    blueprint: blueprint.clone(),
                    style_profile: self.config.style_profile.clone(),
                    forbidden_commitments: self.config.review.forbidden_commitments.clone(),
                    attempt,
                };
                async move {
                    let mut drafted = writer.write(&request).await?;
                    if drafted.section != expected {
                        return Err(CollaboratorError::Malformed(format!(
                            "writer answered for '{}' instead of '{expected}'",
                            drafted.section
                        )));
                    }
                    drafted.category = category;
                    drafted.writer_mode = category.writer_mode().to_string();
                    Ok(drafted)
                }
            },
        )
        .await
    }

    async fn review_stage(&self, case_id: CaseId) -> Result<StageArtifact, PipelineError> {
        let case = self.active_case(case_id)?;
        let (draft_artifact, drafts) = self.current::<DraftSet>(&case, Stage::Write, Stage::Review, "run_write").await?;
        let (blueprint_ref, blueprints) = self.input::<BlueprintSet>(&draft_artifact, Stage::Assemble).await?;
        let (plan_ref, plan) = self.input::<Plan>(&draft_artifact, Stage::Plan).await?;

        let inputs = vec![draft_artifact.reference(), blueprint_ref, plan_ref];
        let key = IdempotencyKey::derive(case_id, Stage::Review, &inputs, None);
        if let Some(existing) = self.replay(&case, Stage::Review, &key).await? {
            return Ok(existing);
        }
        validate_stage_run(case.stage, Stage::Review, case.rework_target)?;

        // Mandatory sections need text unless their evidence gap was overridden
        let missing: Vec<String> = plan
            .sections
            .iter()
            .filter(|spec| spec.mandatory)
            .filter(|spec| drafts.draft.section(&spec.name).map_or(true, DraftSection::is_empty))
            .filter(|spec| {
                !case.is_overridden(&OverrideTarget::Evidence {
                    section: spec.name.clone(),
                })
            })
            .map(|spec| spec.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::Precondition {
                stage: Stage::Review,
                reason: format!("{} mandatory section(s) have no drafted text", missing.len()),
                current: case.stage,
                artifact_version: Some(draft_artifact.version()),
                hints: missing
                    .iter()
                    .map(|s| {
                        RemediationHint::new(
                            "add_override",
                            OverrideTarget::Evidence { section: s.clone() }.to_string(),
                            "supply the missing input or accept the gap",
                        )
                    })
                    .collect(),
                items: missing,
            });
        }
        info!(case_id = %case_id, stage = %Stage::Review, "stage started");

        let facts = case.intake.facts();
        let mut findings = self.validator.validate_draft(&ReviewInput {
            draft: &drafts.draft,
            specs: &plan.sections,
            blueprints: &blueprints.sections,
            intake_facts: &facts,
            jurisdiction: case.intake.jurisdiction(),
        });

        if let Some(reviewer) = &self.reviewer {
            let request = ReviewRequest {
                draft: drafts.draft.clone(),
                policy: self.config.review.clone(),
                blueprints: blueprints.sections.clone(),
                source_map: blueprints
                    .sections
                    .iter()
                    .flat_map(|b| b.clauses.iter().map(|c| (c.id.clone(), c.source_uri.clone())))
                    .collect(),
            };
            let extra = self
                .call_collaborator(
                    case_id,
                    Stage::Review,
                    "reviewer",
                    self.config.reviewer_retry,
                    Some(draft_artifact.version()),
                    None,
                    |_| reviewer.review(&request),
                )
                .await?;
            findings.extend(extra);
            let mut seen = HashSet::new();
            findings.retain(|f| seen.insert(f.id.clone()));
            sort_findings(&mut findings);
        }

        let report = ReviewReport::from_findings(findings);
        if report.critical > 0 {
            warn!(case_id = %case_id, critical = report.critical, "critical findings raised");
        }
        self.commit_and_finish(case_id, &report, key, inputs).await
    }

    async fn approve_inner(&self, case_id: CaseId, approver: &str) -> Result<Case, PipelineError> {
        let mut fields = Vec::new();
        required(approver, "approver", &mut fields);
        validation("approval needs an approver", fields)?;

        let case = self.active_case(case_id)?;
        validate_transition(case.stage, CaseStage::Approved)?;
        let (report_artifact, report) = self
            .current::<ReviewReport>(&case, Stage::Review, Stage::Review, "run_review")
            .await?;

        let open: Vec<&Finding> = report
            .critical_findings()
            .filter(|f| !case.is_overridden(&OverrideTarget::Finding { id: f.id.clone() }))
            .collect();
        if !open.is_empty() {
            return Err(PipelineError::Precondition {
                stage: Stage::Review,
                reason: format!("{} critical finding(s) open", open.len()),
                current: case.stage,
                artifact_version: Some(report_artifact.version()),
                items: open.iter().map(|f| f.id.clone()).collect(),
                hints: open
                    .iter()
                    .map(|f| {
                        RemediationHint::new(
                            "add_override",
                            OverrideTarget::Finding { id: f.id.clone() }.to_string(),
                            f.remediation.clone(),
                        )
                    })
                    .collect(),
            });
        }

        let case = self.update_case(case_id, |c| {
            c.enter(CaseStage::Approved);
            c.clone()
        })?;
        info!(case_id = %case_id, approver, review_version = report_artifact.version(), "case approved");
        self.diagnostics.record(
            EventDraft::new(case_id, EventKind::Approved, "approved")
                .stage(Stage::Review)
                .detail(json!({ "approver": approver, "review_version": report_artifact.version() })),
        );
        Ok(case)
    }

    async fn rework_inner(&self, case_id: CaseId, target: Stage, reason: &str) -> Result<Case, PipelineError> {
        let mut fields = Vec::new();
        if !matches!(target, Stage::Write | Stage::Retrieve) {
            fields.push("target".to_string());
        }
        required(reason, "reason", &mut fields);
        validation("rework targets WRITE or RETRIEVE and needs a reason", fields)?;

        let case = self.active_case(case_id)?;
        validate_transition(case.stage, CaseStage::Rework)?;

        let mut stages = vec![target];
        stages.extend_from_slice(target.downstream());
        self.supersede(case_id, &stages, "rework").await?;

        let case = self.update_case(case_id, |c| {
            c.rework_target = Some(target);
            c.enter(CaseStage::Rework);
            c.clone()
        })?;
        info!(case_id = %case_id, target = %target, reason, "rework requested");
        self.diagnostics.record(
            EventDraft::new(case_id, EventKind::ReworkRequested, target.to_string())
                .stage(target)
                .detail(json!({ "reason": reason })),
        );
        Ok(case)
    }

    // ------------------------------------------------------------------
    // Protocol helpers
    // ------------------------------------------------------------------

    fn case(&self, case_id: CaseId) -> Result<Case, PipelineError> {
        self.cases
            .get(&case_id)
            .map(|c| c.value().clone())
            .ok_or(PipelineError::UnknownCase(case_id))
    }

    fn active_case(&self, case_id: CaseId) -> Result<Case, PipelineError> {
        let case = self.case(case_id)?;
        if case.cancelled {
            return Err(PipelineError::Cancelled(case_id));
        }
        Ok(case)
    }

    fn update_case<R>(&self, case_id: CaseId, f: impl FnOnce(&mut Case) -> R) -> Result<R, PipelineError> {
        let mut entry = self.cases.get_mut(&case_id).ok_or(PipelineError::UnknownCase(case_id))?;
        Ok(f(entry.value_mut()))
    }

    fn observe<T>(&self, case_id: CaseId, stage: Stage, result: Result<T, PipelineError>) -> Result<T, PipelineError> {
        if let Err(e) = &result {
            match e {
                PipelineError::UnknownCase(_) => return result,
                PipelineError::CollaboratorFailure { .. }
                | PipelineError::ConcurrentVersionConflict { .. }
                | PipelineError::Artifact(_)
                | PipelineError::Store(_) => {
                    error!(case_id = %case_id, stage = %stage, kind = %e.kind(), error = %e, "stage failed");
                }
                _ => warn!(case_id = %case_id, stage = %stage, kind = %e.kind(), error = %e, "stage refused"),
            }
            self.diagnostics.record(
                EventDraft::new(case_id, EventKind::StageFailed, e.kind().as_str())
                    .stage(stage)
                    .detail(serde_json::to_value(e.to_report()).unwrap_or_default()),
            );
        }
        result
    }

    /// Current artifact of `stage`, decoded
    async fn current<P: ArtifactPayload>(
        &self,
        case: &Case,
        stage: Stage,
        needed_by: Stage,
        action: &str,
    ) -> Result<(StageArtifact, P), PipelineError> {
        let artifact = self
            .store
            .latest(case.id, stage)
            .await?
            .ok_or_else(|| PipelineError::Precondition {
                stage: needed_by,
                reason: format!("no current {stage} artifact"),
                current: case.stage,
                artifact_version: None,
                items: Vec::new(),
                hints: vec![RemediationHint::new(action, stage.to_string(), format!("produce {stage} first"))],
            })?;
        let payload = artifact.decode::<P>()?;
        Ok((artifact, payload))
    }

    /// The exact input version named in an artifact's lineage
    async fn input<P: ArtifactPayload>(&self, from: &StageArtifact, stage: Stage) -> Result<(ArtifactRef, P), PipelineError> {
        let missing = || {
            PipelineError::Artifact(ArtifactError::InvariantViolation(format!(
                "{} v{} has no {stage} in its lineage",
                from.stage(),
                from.version()
            )))
        };
        let reference = from
            .lineage()
            .iter()
            .find(|r| r.stage == stage)
            .copied()
            .ok_or_else(missing)?;
        let artifact = self
            .store
            .get(from.case_id(), stage, reference.version)
            .await?
            .ok_or_else(missing)?;
        Ok((reference, artifact.decode::<P>()?))
    }

    /// Artifact already produced for `key`, if still current
    async fn replay(&self, case: &Case, stage: Stage, key: &IdempotencyKey) -> Result<Option<StageArtifact>, PipelineError> {
        let Some(existing) = self.store.find_by_key(case.id, stage, key).await? else {
            return Ok(None);
        };
        info!(case_id = %case.id, stage = %stage, version = existing.version(), "idempotent replay");
        self.diagnostics.record(
            EventDraft::new(case.id, EventKind::IdempotentReplay, format!("v{}", existing.version()))
                .stage(stage)
                .detail(json!({ "key": key.to_string(), "checksum": existing.checksum().to_string() })),
        );
        // A run interrupted between append and state update resumes here
        let next = CaseStage::after(stage);
        if case.stage != next && validate_stage_run(case.stage, stage, case.rework_target).is_ok() {
            self.update_case(case.id, |c| {
                c.rework_target = None;
                c.enter(next);
            })?;
        }
        Ok(Some(existing))
    }

    async fn call_collaborator<T, F, Fut>(
        &self,
        case_id: CaseId,
        stage: Stage,
        collaborator: &'static str,
        policy: RetryPolicy,
        artifact_version: Option<u32>,
        feedback: Option<&Mutex<Option<String>>>,
        op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let answered = policy
            .run(collaborator, op, |attempt, failure| {
                if let (Some(slot), AttemptFailure::Failed(CollaboratorError::Malformed(message))) = (feedback, failure) {
                    *slot.lock() = Some(message.clone());
                }
                warn!(case_id = %case_id, stage = %stage, collaborator, attempt, error = %failure, "collaborator attempt failed");
                self.diagnostics.record(
                    EventDraft::new(case_id, EventKind::CollaboratorAttempt, failure.to_string())
                        .stage(stage)
                        .attempt(attempt)
                        .detail(json!({ "collaborator": collaborator })),
                );
            })
            .await
            .map_err(|e| collaborator_failure(stage, collaborator, e, artifact_version))?;

        self.diagnostics.record(
            EventDraft::new(case_id, EventKind::CollaboratorAttempt, "ok")
                .stage(stage)
                .attempt(answered.attempts)
                .detail(json!({ "collaborator": collaborator })),
        );
        Ok(answered.value)
    }

    async fn commit_and_finish<P: ArtifactPayload>(
        &self,
        case_id: CaseId,
        payload: &P,
        key: IdempotencyKey,
        lineage: Vec<ArtifactRef>,
    ) -> Result<StageArtifact, PipelineError> {
        let (artifact, fresh) = self.commit(case_id, payload, key, lineage).await?;
        if fresh {
            self.finish(case_id, &artifact).await?;
        }
        Ok(artifact)
    }

    /// Append at head + 1; `false` when a concurrent run already produced
    /// the same key
    async fn commit<P: ArtifactPayload>(
        &self,
        case_id: CaseId,
        payload: &P,
        key: IdempotencyKey,
        lineage: Vec<ArtifactRef>,
    ) -> Result<(StageArtifact, bool), PipelineError> {
        let stage = P::STAGE;
        if let Some(winner) = self.store.find_by_key(case_id, stage, &key).await? {
            debug!(case_id = %case_id, stage = %stage, version = winner.version(), "concurrent run committed first");
            return Ok((winner, false));
        }
        let version = self.store.head_version(case_id, stage).await?.saturating_add(1);
        let sealed = StageArtifact::seal(case_id, version, payload, key, lineage)?;
        match self.store.append(sealed.clone()).await {
            Ok(_) => Ok((sealed, true)),
            Err(e) if e.is_version_conflict() => {
                if let Some(winner) = self.store.find_by_key(case_id, stage, &key).await? {
                    debug!(case_id = %case_id, stage = %stage, version = winner.version(), "concurrent run produced the same artifact");
                    self.diagnostics.record(
                        EventDraft::new(case_id, EventKind::IdempotentReplay, format!("v{}", winner.version())).stage(stage),
                    );
                    return Ok((winner, false));
                }
                let head = self.store.head_version(case_id, stage).await?;
                let retried = sealed.reversioned(head.saturating_add(1));
                warn!(case_id = %case_id, stage = %stage, lost = version, retry = retried.version(), "version conflict, re-applying");
                self.diagnostics.record(
                    EventDraft::new(case_id, EventKind::VersionConflictRetried, format!("v{version} -> v{}", retried.version()))
                        .stage(stage),
                );
                self.store.append(retried.clone()).await?;
                Ok((retried, true))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn finish(&self, case_id: CaseId, artifact: &StageArtifact) -> Result<(), PipelineError> {
        let stage = artifact.stage();
        let version = artifact.version();
        let cancelled = self.cases.get(&case_id).map_or(true, |c| c.cancelled);
        if cancelled {
            self.store.mark_superseded(case_id, stage, version).await?;
            warn!(case_id = %case_id, stage = %stage, version, "late result discarded for cancelled case");
            self.diagnostics.record(
                EventDraft::new(case_id, EventKind::LateResultDiscarded, format!("v{version}")).stage(stage),
            );
            return Err(PipelineError::Cancelled(case_id));
        }

        if version > 1 {
            self.store.mark_superseded(case_id, stage, version - 1).await?;
        }
        self.supersede(case_id, stage.downstream(), &format!("{stage} v{version}"))
            .await?;

        let next = CaseStage::after(stage);
        self.update_case(case_id, |c| {
            if stage == Stage::Plan {
                c.plan_lock = None;
            }
            c.rework_target = None;
            c.enter(next);
        })?;
        info!(case_id = %case_id, stage = %stage, version, checksum = %artifact.checksum().short(), state = %next, "stage committed");
        self.diagnostics.record(
            EventDraft::new(case_id, EventKind::StageCommitted, format!("v{version}"))
                .stage(stage)
                .detail(json!({
                    "checksum": artifact.checksum().to_string(),
                    "lineage": artifact.lineage(),
                    "state": next,
                })),
        );
        Ok(())
    }

    /// Take the current head of each chain out of the current view
    async fn supersede(&self, case_id: CaseId, stages: &[Stage], cause: &str) -> Result<(), PipelineError> {
        let mut marked = Vec::new();
        for &stage in stages {
            let head = self.store.head_version(case_id, stage).await?;
            if head == 0 || self.store.superseded(case_id, stage).await?.contains(&head) {
                continue;
            }
            self.store.mark_superseded(case_id, stage, head).await?;
            marked.push(json!({ "stage": stage, "through": head }));
        }
        if !marked.is_empty() {
            debug!(case_id = %case_id, cause, chains = marked.len(), "chains superseded");
            self.diagnostics.record(
                EventDraft::new(case_id, EventKind::Superseded, cause.to_string()).detail(json!({ "chains": marked })),
            );
        }
        Ok(())
    }
}
