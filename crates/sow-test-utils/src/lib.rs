//! Testing utilities for the SOW pipeline workspace
//!
//! Shared fixtures and scripted collaborators.

#![allow(missing_docs)]

use async_trait::async_trait;
use sow_artifact::{ArtifactStore, MemoryArtifactStore};
use sow_core::{
    CollaboratorError, ExtractiveWriter, Intake, IntakeContext, Orchestrator, PipelineConfig, PlanRequest,
    PlanResponse, Planner, ReviewRequest, Reviewer, TaxonomyPlanner, WriteRequest, Writer,
};
use sow_retrieval::{
    ChunkMetadata, FilterDimension, FilterSet, KnowledgeCapability, KnowledgeError, KnowledgeHit, LocalCorpus,
    RetrievalQuery, RetryPolicy, RiskLevel, SectionCategory, SectionSpec,
};
use sow_review::{DraftParagraph, DraftSection, Finding};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

pub const DOC_TYPE: &str = "sow";
pub const SCOPE: &str = "Scope";
pub const LIABILITY: &str = "Limitation of Liability";

/// Complete intake for a healthcare engagement
pub fn sample_intake() -> Intake {
    Intake::new()
        .with_client("Acme Health")
        .with_scope("claims triage model")
        .with_delivery_model("fixed_price")
        .with_jurisdiction("US")
        .with_context(IntakeContext {
            industry: Some("healthcare".into()),
            ..IntakeContext::default()
        })
}

/// Overview (template), Scope and Limitation of Liability
///
/// Liability relaxes `tags` then `industry` and wants five candidates.
pub fn sample_taxonomy() -> Vec<SectionSpec> {
    vec![
        SectionSpec::new("Overview", "engagement summary")
            .with_category(SectionCategory::Template)
            .with_required_fields(vec!["client".into(), "scope".into()]),
        SectionSpec::new(SCOPE, "deliverables and acceptance")
            .with_filters(FilterSet::new().with(FilterDimension::ClauseType, "scope"))
            .with_min_candidates(2)
            .with_relaxation_order(vec![FilterDimension::Industry]),
        SectionSpec::new(LIABILITY, "bound each party's exposure")
            .with_filters(
                FilterSet::new()
                    .with(FilterDimension::ClauseType, "limitation_of_liability")
                    .with(FilterDimension::Tags, vec!["cap".to_string()]),
            )
            .with_min_candidates(5)
            .with_relaxation_order(vec![FilterDimension::Tags, FilterDimension::Industry]),
    ]
}

pub fn record(id: &str, section: &str, clause_type: &str, industry: &str, tags: &[&str], text: &str, score: f64) -> KnowledgeHit {
    KnowledgeHit {
        chunk_id: Some(id.into()),
        source_uri: Some(format!("kb://clauses/{id}")),
        text: Some(text.into()),
        score,
        metadata: ChunkMetadata::new()
            .with("section", section)
            .with("clause_type", clause_type)
            .with("industry", industry)
            .with("tags", tags.iter().map(|t| (*t).to_string()).collect::<Vec<_>>()),
        ..KnowledgeHit::default()
    }
}

fn with_risk(mut hit: KnowledgeHit, risk: RiskLevel) -> KnowledgeHit {
    hit.metadata = hit.metadata.with("risk_level", risk);
    hit
}

/// Corpus records for [`sample_taxonomy`]
///
/// Liability yields 2 strict hits, 3 with `tags` relaxed and 6 with
/// `industry` relaxed. `lol-1` (low) and `lol-2` (high) are the primaries and
/// conflict on risk level.
pub fn sample_records() -> Vec<KnowledgeHit> {
    let lol = "limitation_of_liability";
    vec![
        record("scope-1", SCOPE, "scope", "healthcare", &["scope", "deliverables", "model"],
            "The vendor delivers a claims triage model, its training pipeline and operating documentation.", 0.92),
        record("scope-2", SCOPE, "scope", "healthcare", &["scope", "handover", "runbooks"],
            "The vendor hands over source code, runbooks and a knowledge transfer session at completion.", 0.85),
        with_risk(
            record("lol-1", LIABILITY, lol, "healthcare", &["cap", "liability", "fees"],
                "Aggregate liability of either party is capped at the fees paid under this statement of work.", 0.95),
            RiskLevel::Low,
        ),
        with_risk(
            record("lol-2", LIABILITY, lol, "healthcare", &["cap", "liability", "data"],
                "Liability for data protection breaches is capped at three times the annual fees.", 0.90),
            RiskLevel::High,
        ),
        record("lol-3", LIABILITY, lol, "healthcare", &["liability", "exclusions", "indirect"],
            "Neither party is liable for indirect or consequential losses arising under this engagement.", 0.80),
        record("lol-4", LIABILITY, lol, "fintech", &["liability", "fraud", "misconduct"],
            "Liability caps do not apply to fraud or wilful misconduct by either party.", 0.70),
        record("lol-5", LIABILITY, lol, "retail", &["liability", "personnel", "subcontractors"],
            "Each party remains responsible for losses caused by its own personnel and subcontractors.", 0.65),
        record("lol-6", LIABILITY, lol, "public_sector", &["liability", "notice", "claims"],
            "Claims must be notified in writing within twelve months of the event giving rise to them.", 0.60),
    ]
}

pub fn sample_corpus() -> LocalCorpus {
    LocalCorpus::from_records(sample_records())
}

/// Retry policy with millisecond backoff
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(3)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(4))
        .with_timeout(Duration::from_secs(5))
}

/// Default config with the sample taxonomy and fast retries
pub fn sample_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_taxonomy(DOC_TYPE, sample_taxonomy())
        .with_planner_retry(fast_retry())
        .with_knowledge_retry(fast_retry())
        .with_writer_retry(fast_retry())
        .with_reviewer_retry(fast_retry())
}

/// Orchestrator wiring for tests
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub knowledge: Arc<CountingKnowledge>,
    pub store: Arc<MemoryArtifactStore>,
}

impl Harness {
    pub fn new(config: PipelineConfig, planner: Arc<dyn Planner>, writer: Arc<dyn Writer>) -> Self {
        let knowledge = Arc::new(CountingKnowledge::new(sample_corpus()));
        let store = Arc::new(MemoryArtifactStore::new());
        let store_dyn: Arc<dyn ArtifactStore> = store.clone();
        let orchestrator = Orchestrator::new(config, store_dyn, knowledge.clone(), planner, writer)
            .expect("sample config is valid");
        Self {
            orchestrator,
            knowledge,
            store,
        }
    }

    /// Sample config, taxonomy planner, extractive writer
    pub fn standard() -> Self {
        Self::new(sample_config(), Arc::new(TaxonomyPlanner), Arc::new(ExtractiveWriter))
    }

    pub fn with_writer(writer: Arc<dyn Writer>) -> Self {
        Self::new(sample_config(), Arc::new(TaxonomyPlanner), writer)
    }
}

/// Knowledge capability counting every call
#[derive(Debug)]
pub struct CountingKnowledge {
    inner: LocalCorpus,
    queries: AtomicUsize,
    fetches: AtomicUsize,
    fail_next: AtomicU32,
}

impl CountingKnowledge {
    pub fn new(inner: LocalCorpus) -> Self {
        Self {
            inner,
            queries: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Make the next `n` queries fail as unavailable
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KnowledgeCapability for CountingKnowledge {
    async fn query(&self, query: &RetrievalQuery, top_k: usize) -> Result<Vec<KnowledgeHit>, KnowledgeError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(KnowledgeError::Unavailable("scripted outage".into()));
        }
        self.inner.query(query, top_k).await
    }

    async fn fetch_object(&self, source_uri: &str) -> Result<Option<serde_json::Value>, KnowledgeError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_object(source_uri).await
    }
}

/// Planner that fails a set number of times before delegating to [`TaxonomyPlanner`]
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    failures: AtomicU32,
    malformed: bool,
    calls: AtomicU32,
}

impl ScriptedPlanner {
    /// Fail `n` times as unavailable
    pub fn failing(n: u32) -> Self {
        Self {
            failures: AtomicU32::new(n),
            ..Self::default()
        }
    }

    /// Answer with an empty plan `n` times
    pub fn malformed(n: u32) -> Self {
        Self {
            failures: AtomicU32::new(n),
            malformed: true,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanResponse, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        match (failing, self.malformed) {
            (true, true) => Ok(PlanResponse {
                sections: Vec::new(),
                validation_rules: Vec::new(),
            }),
            (true, false) => Err(CollaboratorError::Unavailable("scripted outage".into())),
            (false, _) => TaxonomyPlanner.plan(request).await,
        }
    }
}

/// Writer answering fixed drafts for chosen sections and extracting the rest
#[derive(Debug, Default)]
pub struct ScriptedWriter {
    fixed: BTreeMap<String, DraftSection>,
    calls: AtomicU32,
}

impl ScriptedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `section` with one paragraph mapped to `clause_ids`
    #[must_use]
    pub fn with_paragraph(mut self, section: &str, text: &str, clause_ids: &[&str]) -> Self {
        let draft = DraftSection::new(section, SectionCategory::Clause).with_paragraph(DraftParagraph::from_clauses(
            text,
            clause_ids.iter().map(|c| (*c).to_string()).collect(),
        ));
        self.fixed.insert(section.to_string(), draft);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Writer for ScriptedWriter {
    async fn write(&self, request: &WriteRequest) -> Result<DraftSection, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.fixed.get(&request.section.name) {
            Some(draft) => Ok(draft.clone()),
            None => ExtractiveWriter.write(request).await,
        }
    }
}

/// Writer that parks every call until released
#[derive(Debug)]
pub struct GatedWriter {
    started: Semaphore,
    release: Semaphore,
}

impl Default for GatedWriter {
    fn default() -> Self {
        Self {
            started: Semaphore::new(0),
            release: Semaphore::new(0),
        }
    }
}

impl GatedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a write call has started
    pub async fn wait_started(&self) {
        if let Ok(permit) = self.started.acquire().await {
            permit.forget();
        }
    }

    /// Let every parked and future call proceed
    pub fn release(&self) {
        self.release.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl Writer for GatedWriter {
    async fn write(&self, request: &WriteRequest) -> Result<DraftSection, CollaboratorError> {
        self.started.add_permits(1);
        let _permit = self
            .release
            .acquire()
            .await
            .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;
        ExtractiveWriter.write(request).await
    }
}

/// Reviewer returning the same findings every time
#[derive(Debug, Default)]
pub struct FixedReviewer {
    findings: Vec<Finding>,
    calls: AtomicU32,
}

impl FixedReviewer {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reviewer for FixedReviewer {
    async fn review(&self, _request: &ReviewRequest) -> Result<Vec<Finding>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.findings.clone())
    }
}
