//! Case lifecycle beyond the happy path: idempotency, rework, cancellation,
//! overrides, retries and the diagnostics log.

use pretty_assertions::assert_eq;
use sow_artifact::{ArtifactStore, CaseId, Stage};
use sow_core::{
    CaseStage, DraftSet, ErrorKind, EventKind, ExtractiveWriter, Orchestrator, OverrideTarget, PipelineError,
    ReviewReport,
};
use sow_retrieval::{FilterDimension, FilterSet, SectionSpec};
use sow_review::{FindingCategory, Location, Severity};
use sow_test_utils::{
    sample_config, sample_intake, sample_taxonomy, FixedReviewer, GatedWriter, Harness, ScriptedPlanner,
    ScriptedWriter, DOC_TYPE, LIABILITY, SCOPE,
};
use std::sync::Arc;

fn liability_conflict() -> OverrideTarget {
    OverrideTarget::Conflict {
        section: LIABILITY.into(),
        left: "lol-1".into(),
        right: "lol-2".into(),
    }
}

async fn to_assembled(orch: &Orchestrator) -> CaseId {
    let case = orch.create_case(sample_intake(), DOC_TYPE);
    let plan = orch.run_plan(case, None).await.unwrap();
    orch.lock_plan(case, plan.version(), "pm@acme").await.unwrap();
    orch.run_retrieve(case).await.unwrap();
    orch.run_assemble(case).await.unwrap();
    orch.add_override(case, liability_conflict(), "both caps reviewed", "legal@acme")
        .unwrap();
    case
}

async fn to_reviewed(orch: &Orchestrator) -> CaseId {
    let case = to_assembled(orch).await;
    orch.run_write(case).await.unwrap();
    orch.run_review(case).await.unwrap();
    case
}

/// The full chain reaches approval and every artifact names its inputs.
#[tokio::test]
async fn approved_case_has_complete_lineage() {
    let h = Harness::standard();
    let orch = &h.orchestrator;
    let case = to_reviewed(orch).await;
    let approved = orch.approve(case, "legal@acme").await.unwrap();
    assert_eq!(approved.stage, CaseStage::Approved);

    let review = orch.get_artifact(case, Stage::Review, None).await.unwrap().unwrap();
    let stages: Vec<_> = review.lineage().iter().map(|r| r.stage).collect();
    assert_eq!(stages, vec![Stage::Write, Stage::Assemble, Stage::Plan]);
    for input in review.lineage() {
        let stored = orch.get_artifact(case, input.stage, Some(input.version)).await.unwrap().unwrap();
        assert_eq!(*stored.checksum(), input.checksum);
    }

    let md = orch.render_markdown(case).await.unwrap();
    assert!(md.starts_with("# Statement of Work - Acme Health"));
    assert!(md.contains(&format!("## {LIABILITY}")));
    assert!(orch.recorder().verify_integrity().is_ok());

    // approval is terminal
    let err = orch.rework(case, Stage::Write, "late change").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StageViolation);
}

/// Rework to WRITE re-drafts against the same blueprint; the new version is
/// byte-identical because nothing upstream changed.
#[tokio::test]
async fn rework_to_write_produces_a_new_identical_version() {
    let h = Harness::standard();
    let orch = &h.orchestrator;
    let case = to_reviewed(orch).await;
    let first = orch.get_artifact(case, Stage::Write, None).await.unwrap().unwrap();

    let reworked = orch.rework(case, Stage::Write, "tighten scope wording").await.unwrap();
    assert_eq!(reworked.stage, CaseStage::Rework);
    assert!(orch.get_artifact(case, Stage::Write, None).await.unwrap().is_none());
    assert!(orch.get_artifact(case, Stage::Review, None).await.unwrap().is_none());

    // REWORK only exits through the named stage
    let err = orch.approve(case, "legal@acme").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StageViolation);
    assert_eq!(orch.run_review(case).await.unwrap_err().kind(), ErrorKind::Precondition);

    let second = orch.run_write(case).await.unwrap();
    assert_eq!(second.version(), 2);
    assert_eq!(second.checksum(), first.checksum());
    assert_eq!(orch.get_case(case).unwrap().stage, CaseStage::Drafted);

    let review = orch.run_review(case).await.unwrap();
    assert_eq!(review.version(), 2);
    assert_eq!(review.lineage()[0].version, 2);
}

/// Rework to RETRIEVE has to go back through assembly before drafting.
#[tokio::test]
async fn rework_to_retrieve_reruns_the_evidence_chain() {
    let h = Harness::standard();
    let orch = &h.orchestrator;
    let case = to_reviewed(orch).await;
    let queries = h.knowledge.queries();

    orch.rework(case, Stage::Retrieve, "new clauses approved").await.unwrap();
    assert_eq!(orch.run_assemble(case).await.unwrap_err().kind(), ErrorKind::Precondition);

    let retrieval = orch.run_retrieve(case).await.unwrap();
    assert_eq!(retrieval.version(), 2);
    assert!(h.knowledge.queries() > queries);
    assert_eq!(orch.run_assemble(case).await.unwrap().version(), 2);
    orch.run_write(case).await.unwrap();
    orch.run_review(case).await.unwrap();
    orch.approve(case, "legal@acme").await.unwrap();
}

/// Overriding each critical finding releases approval.
#[tokio::test]
async fn finding_overrides_release_approval() {
    let writer = ScriptedWriter::new().with_paragraph(SCOPE, "We guarantee 100% uptime for the triage service.", &["scope-1"]);
    let h = Harness::with_writer(Arc::new(writer));
    let orch = &h.orchestrator;
    let case = to_reviewed(orch).await;

    let report: ReviewReport = orch
        .get_artifact(case, Stage::Review, None)
        .await
        .unwrap()
        .unwrap()
        .decode()
        .unwrap();
    let critical: Vec<_> = report.critical_findings().cloned().collect();
    assert!(!critical.is_empty());

    let (last, rest) = critical.split_last().unwrap();
    for finding in rest {
        orch.add_override(case, OverrideTarget::Finding { id: finding.id.clone() }, "client accepts", "legal@acme")
            .unwrap();
    }
    let err = orch.approve(case, "legal@acme").await.unwrap_err();
    assert!(matches!(&err, PipelineError::Precondition { items, .. } if items == &vec![last.id.clone()]));

    orch.add_override(case, OverrideTarget::Finding { id: last.id.clone() }, "client accepts", "legal@acme")
        .unwrap();
    orch.approve(case, "legal@acme").await.unwrap();
    assert_eq!(orch.recorder().count(case, EventKind::OverrideAdded), critical.len() + 1);
}

/// A reviewer's findings are unioned with the deterministic ones.
#[tokio::test]
async fn reviewer_findings_join_the_report() {
    let note = sow_review::Finding::new(
        Severity::Warning,
        FindingCategory::ReviewerNote,
        Location::section(SCOPE),
        "style:passive_voice",
        "prefer active voice",
    );
    let reviewer = Arc::new(FixedReviewer::new(vec![note.clone(), note.clone()]));
    let mut h = Harness::standard();
    h.orchestrator = h.orchestrator.with_reviewer(reviewer.clone());
    let case = to_reviewed(&h.orchestrator).await;

    let report: ReviewReport = h
        .orchestrator
        .get_artifact(case, Stage::Review, None)
        .await
        .unwrap()
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!(reviewer.calls(), 1);
    assert_eq!(report.findings.iter().filter(|f| f.id == note.id).count(), 1);
}

/// A mandatory section with no evidence stops at ASSEMBLE until its gap is
/// accepted, then drafts as NEEDS_INPUT and passes the review gate.
#[tokio::test]
async fn evidence_shortfall_needs_an_override() {
    let mut taxonomy = sample_taxonomy();
    taxonomy.push(
        SectionSpec::new("Data Protection", "processing terms")
            .with_filters(FilterSet::new().with(FilterDimension::ClauseType, "data_protection"))
            .with_min_candidates(1),
    );
    let h = Harness::new(
        sample_config().with_taxonomy(DOC_TYPE, taxonomy),
        Arc::new(sow_core::TaxonomyPlanner),
        Arc::new(ExtractiveWriter),
    );
    let orch = &h.orchestrator;
    let case = orch.create_case(sample_intake(), DOC_TYPE);
    let plan = orch.run_plan(case, None).await.unwrap();
    orch.lock_plan(case, plan.version(), "pm@acme").await.unwrap();
    orch.run_retrieve(case).await.unwrap();

    let err = orch.run_assemble(case).await.unwrap_err();
    match &err {
        PipelineError::InsufficientEvidence { sections, .. } => {
            assert_eq!(sections.len(), 1);
            assert_eq!(sections[0].section, "Data Protection");
            assert_eq!(sections[0].found, 0);
            assert!(sections[0].remaining_filters.contains(&FilterDimension::ClauseType));
        }
        other => panic!("unexpected error: {other}"),
    }
    let actions: Vec<_> = err.to_report().hints.into_iter().map(|h| h.action).collect();
    assert_eq!(actions, vec!["relax_filters", "add_override"]);

    let gap = OverrideTarget::Evidence {
        section: "Data Protection".into(),
    };
    orch.add_override(case, gap, "client supplies a DPA", "legal@acme").unwrap();
    orch.add_override(case, liability_conflict(), "accepted", "legal@acme").unwrap();
    orch.run_assemble(case).await.unwrap();
    let drafts: DraftSet = orch.run_write(case).await.unwrap().decode().unwrap();
    assert!(drafts.draft.section("Data Protection").unwrap().is_empty());
    orch.run_review(case).await.unwrap();
}

/// A planner that recovers inside its budget still produces one plan, and
/// every attempt is on record.
#[tokio::test]
async fn planner_recovers_within_budget() {
    let planner = Arc::new(ScriptedPlanner::failing(2));
    let h = Harness::new(sample_config(), planner.clone(), Arc::new(ExtractiveWriter));
    let orch = &h.orchestrator;
    let case = orch.create_case(sample_intake(), DOC_TYPE);

    let plan = orch.run_plan(case, None).await.unwrap();
    assert_eq!(plan.version(), 1);
    assert_eq!(planner.calls(), 3);
    let attempts: Vec<_> = orch
        .diagnostics(case)
        .into_iter()
        .filter(|e| e.kind == EventKind::CollaboratorAttempt)
        .map(|e| (e.attempt, e.outcome))
        .collect();
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[2], (3, "ok".to_string()));
}

/// Malformed plans count against the same budget and surface as a
/// collaborator failure.
#[tokio::test]
async fn persistent_malformed_plans_exhaust_the_budget() {
    let planner = Arc::new(ScriptedPlanner::malformed(5));
    let h = Harness::new(sample_config(), planner.clone(), Arc::new(ExtractiveWriter));
    let case = h.orchestrator.create_case(sample_intake(), DOC_TYPE);

    let err = h.orchestrator.run_plan(case, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CollaboratorFailure);
    assert_eq!(planner.calls(), 3);
    assert_eq!(h.store.head_version(case, Stage::Plan).await.unwrap(), 0);
}

/// A knowledge outage longer than the budget fails retrieval and persists nothing.
#[tokio::test]
async fn knowledge_outage_fails_retrieval() {
    let h = Harness::standard();
    let orch = &h.orchestrator;
    let case = orch.create_case(sample_intake(), DOC_TYPE);
    let plan = orch.run_plan(case, None).await.unwrap();
    orch.lock_plan(case, plan.version(), "pm@acme").await.unwrap();

    h.knowledge.fail_next(100);
    let err = orch.run_retrieve(case).await.unwrap_err();
    let report = err.to_report();
    assert_eq!(report.kind, ErrorKind::CollaboratorFailure);
    assert_eq!(report.artifact_version, Some(plan.version()));
    assert!(orch.get_artifact(case, Stage::Retrieve, None).await.unwrap().is_none());
    assert_eq!(orch.get_case(case).unwrap().stage, CaseStage::PlanReady);

    h.knowledge.fail_next(0);
    orch.run_retrieve(case).await.unwrap();
}

/// Concurrent identical plan runs settle on a single version.
#[tokio::test]
async fn concurrent_plan_runs_share_one_artifact() {
    let h = Harness::standard();
    let orch = &h.orchestrator;
    let case = orch.create_case(sample_intake(), DOC_TYPE);

    let (a, b) = tokio::join!(orch.run_plan(case, Some("t")), orch.run_plan(case, Some("t")));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.version(), b.version());
    assert_eq!(a.checksum(), b.checksum());
    assert_eq!(h.store.head_version(case, Stage::Plan).await.unwrap(), 1);
}

/// A stage finishing after cancellation is discarded.
#[tokio::test]
async fn late_result_after_cancel_is_discarded() {
    let writer = Arc::new(GatedWriter::new());
    let h = Arc::new(Harness::with_writer(writer.clone()));
    let case = to_assembled(&h.orchestrator).await;

    let running = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.orchestrator.run_write(case).await })
    };
    writer.wait_started().await;
    h.orchestrator.cancel(case, "client withdrew").unwrap();
    writer.release();

    let err = running.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(h.orchestrator.get_artifact(case, Stage::Write, None).await.unwrap().is_none());
    assert_eq!(h.orchestrator.recorder().count(case, EventKind::LateResultDiscarded), 1);

    let after = h.orchestrator.get_case(case).unwrap();
    assert!(after.cancelled);
    assert_eq!(after.stage, CaseStage::Assembled);
}
