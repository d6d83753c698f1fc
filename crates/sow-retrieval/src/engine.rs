//! Retrieval-with-fallback engine
//!
//! The strict query carries every filter the section (or, failing that, the
//! intake context) provides. While the deduplicated candidate count stays
//! under the section minimum, filters are dropped one dimension at a time,
//! cumulatively, in the section's relaxation order. The first level that
//! meets the minimum wins. The section scope is never dropped.

use crate::candidate::ClauseCandidate;
use crate::dedup::dedupe;
use crate::error::RetrievalError;
use crate::filters::{FilterDimension, FilterSet, RetrievalContext, RetrievalQuery};
use crate::knowledge::KnowledgeCapability;
use crate::normalize::{Normalized, Normalizer};
use crate::retry::{RetryError, RetryPolicy};
use crate::section::SectionSpec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One executed query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryAttempt {
    /// 1-based position in the relaxation sequence
    pub attempt: u32,
    pub query: RetrievalQuery,
    /// Dimensions dropped so far
    pub relaxed: Vec<FilterDimension>,
    /// Hits returned by the knowledge capability
    pub raw_count: usize,
    /// Hits dropped during normalization
    pub discarded: usize,
    /// Candidates left after deduplication
    pub deduped_count: usize,
    /// Calls needed to get an answer (1 unless transient failures occurred)
    pub transport_attempts: u32,
}

/// Audit record of one section's retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalDiagnostics {
    pub section: String,
    pub min_candidates: usize,
    /// Attempts in execution order
    pub attempts: Vec<QueryAttempt>,
    pub fallback_activated: bool,
    pub relaxed_dimensions: Vec<FilterDimension>,
    pub final_count: usize,
}

/// Evidence level reached by a section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceStatus {
    /// Minimum met
    Satisfied,
    /// Some candidates, but fewer than the minimum after every relaxation
    BelowMinimum,
    /// No candidates at all
    InsufficientEvidence,
}

/// Candidates and diagnostics for one section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRetrieval {
    pub section: String,
    pub status: EvidenceStatus,
    pub candidates: Vec<ClauseCandidate>,
    pub diagnostics: RetrievalDiagnostics,
}

/// Strict query for a section
///
/// Section filters win; the intake context fills dimensions the section
/// leaves unset. Unresolved templates and empty values are omitted.
#[must_use]
pub fn build_strict_query(spec: &SectionSpec, context: &RetrievalContext) -> RetrievalQuery {
    let mut filters: FilterSet = spec.filters.clone().resolve_templates(|_| None);
    for (dimension, value) in context.values().iter() {
        if !filters.contains(dimension) {
            filters.insert(dimension, value.clone());
        }
    }
    RetrievalQuery {
        section: spec.name.clone(),
        filters,
    }
}

/// Ordered query sequence: the strict query, then one query per relaxation
///
/// Dimensions the strict query does not carry are skipped, so every entry
/// differs from its predecessor by exactly one dropped filter.
#[must_use]
pub fn relaxation_plan(
    strict: &RetrievalQuery,
    order: &[FilterDimension],
) -> Vec<(Vec<FilterDimension>, RetrievalQuery)> {
    let mut plan = vec![(Vec::new(), strict.clone())];
    let mut relaxed: Vec<FilterDimension> = Vec::new();
    for dimension in order {
        if !strict.filters.contains(*dimension) || relaxed.contains(dimension) {
            continue;
        }
        relaxed.push(*dimension);
        plan.push((relaxed.clone(), strict.without(&relaxed)));
    }
    plan
}

/// Section-scoped retrieval against a knowledge capability
#[derive(Clone)]
pub struct RetrievalEngine {
    knowledge: Arc<dyn KnowledgeCapability>,
    normalizer: Normalizer,
    retry: RetryPolicy,
    top_k: usize,
    default_min_candidates: usize,
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("normalizer", &self.normalizer)
            .field("retry", &self.retry)
            .field("top_k", &self.top_k)
            .field("default_min_candidates", &self.default_min_candidates)
            .finish_non_exhaustive()
    }
}

impl RetrievalEngine {
    /// Engine with default settings (top_k 8, minimum 5, 20-char clauses)
    #[must_use]
    pub fn new(knowledge: Arc<dyn KnowledgeCapability>) -> Self {
        Self {
            knowledge,
            normalizer: Normalizer::default(),
            retry: RetryPolicy::default(),
            top_k: 8,
            default_min_candidates: 5,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_min_candidates(mut self, min: usize) -> Self {
        self.default_min_candidates = min.max(1);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Retrieve candidates for one section
    ///
    /// # Errors
    /// - `InvalidSection` if the section spec is malformed
    /// - `Unavailable` if the knowledge capability exhausts the retry budget
    /// - `Knowledge` if the knowledge capability rejects a query outright
    pub async fn retrieve(
        &self,
        spec: &SectionSpec,
        context: &RetrievalContext,
    ) -> Result<SectionRetrieval, RetrievalError> {
        spec.validate()?;
        let section = spec.name.as_str();
        let min_candidates = spec
            .fallback
            .min_candidates
            .unwrap_or(self.default_min_candidates)
            .max(1);
        let policy = match spec.fallback.max_retries {
            Some(retries) => self.retry.with_max_attempts(retries.saturating_add(1)),
            None => self.retry,
        };

        let strict = build_strict_query(spec, context);
        let plan = relaxation_plan(&strict, &spec.fallback.relaxation_order);
        tracing::info!(section, min_candidates, levels = plan.len(), "retrieval started");

        let mut attempts = Vec::new();
        let mut candidates = Vec::new();
        let mut relaxed_dimensions = Vec::new();

        for (index, (relaxed, query)) in plan.into_iter().enumerate() {
            let attempt = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let answered = policy
                .run(
                    "knowledge.query",
                    |_| self.knowledge.query(&query, self.top_k),
                    |call, failure| {
                        tracing::warn!(section, attempt, call, error = %failure, "knowledge query failed");
                    },
                )
                .await
                .map_err(|e| match e {
                    RetryError::Exhausted { attempts, last } => RetrievalError::Unavailable {
                        section: section.to_string(),
                        attempts,
                        last_error: last,
                    },
                    RetryError::Permanent { error, .. } => RetrievalError::Knowledge {
                        section: section.to_string(),
                        source: error,
                    },
                })?;

            let hits = answered.value;
            let raw_count = hits.len();
            let mut normalized = Vec::with_capacity(raw_count);
            for hit in hits {
                if let Normalized::Candidate(candidate) = self
                    .normalizer
                    .normalize(section, hit, self.knowledge.as_ref())
                    .await
                {
                    normalized.push(candidate);
                }
            }
            let discarded = raw_count - normalized.len();
            let deduped = dedupe(normalized);

            tracing::debug!(
                section,
                attempt,
                relaxed = ?relaxed,
                raw_count,
                discarded,
                deduped_count = deduped.len(),
                "retrieval attempt"
            );

            attempts.push(QueryAttempt {
                attempt,
                query,
                relaxed: relaxed.clone(),
                raw_count,
                discarded,
                deduped_count: deduped.len(),
                transport_attempts: answered.attempts,
            });
            candidates = deduped;
            relaxed_dimensions = relaxed;

            if candidates.len() >= min_candidates {
                break;
            }
        }

        let fallback_activated = attempts.len() > 1;
        if fallback_activated {
            tracing::warn!(section, relaxed = ?relaxed_dimensions, final_count = candidates.len(), "retrieval fallback activated");
        }

        let status = if candidates.is_empty() {
            tracing::warn!(section, "insufficient evidence");
            EvidenceStatus::InsufficientEvidence
        } else if candidates.len() < min_candidates {
            EvidenceStatus::BelowMinimum
        } else {
            EvidenceStatus::Satisfied
        };

        Ok(SectionRetrieval {
            section: section.to_string(),
            status,
            diagnostics: RetrievalDiagnostics {
                section: section.to_string(),
                min_candidates,
                attempts,
                fallback_activated,
                relaxed_dimensions,
                final_count: candidates.len(),
            },
            candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KnowledgeError;
    use crate::filters::FilterValue;
    use crate::knowledge::{ChunkMetadata, KnowledgeHit};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::Mutex;

    /// Query log shared with the fake backend
    #[derive(Default)]
    struct Calls(Mutex<Vec<RetrievalQuery>>);

    impl Calls {
        fn push(&self, q: RetrievalQuery) {
            if let Ok(mut log) = self.0.lock() {
                log.push(q);
            }
        }

        fn snapshot(&self) -> Vec<RetrievalQuery> {
            self.0.lock().map(|log| log.clone()).unwrap_or_default()
        }
    }

    /// Returns as many hits as there are dropped filters, per a fixed table
    struct Tiered {
        by_filter_count: Vec<usize>,
        calls: Calls,
    }

    #[async_trait]
    impl KnowledgeCapability for Tiered {
        async fn query(&self, query: &RetrievalQuery, _top_k: usize) -> Result<Vec<KnowledgeHit>, KnowledgeError> {
            self.calls.push(query.clone());
            let n = self
                .by_filter_count
                .get(query.filters.len())
                .copied()
                .unwrap_or(0);
            Ok((0..n)
                .map(|i| KnowledgeHit {
                    chunk_id: Some(format!("{}-{i}", query.filters.len())),
                    source_uri: Some(format!("kb://{}/{i}", query.filters.len())),
                    text: Some(format!("Clause number {i} at level {} with enough text.", query.filters.len())),
                    score: 1.0 - f64::from(u32::try_from(i).unwrap()) / 100.0,
                    metadata: ChunkMetadata::new().with("section", query.section.as_str()),
                    ..KnowledgeHit::default()
                })
                .collect())
        }

        async fn fetch_object(&self, _: &str) -> Result<Option<serde_json::Value>, KnowledgeError> {
            Ok(None)
        }
    }

    fn liability_section() -> SectionSpec {
        SectionSpec::new("Limitation of Liability", "cap exposure").with_filters(
            FilterSet::new()
                .with(FilterDimension::ClauseType, "limitation_of_liability")
                .with(FilterDimension::Tags, vec!["liability".to_string(), "cap".to_string()]),
        )
    }

    fn context() -> RetrievalContext {
        RetrievalContext::new()
            .with(FilterDimension::Industry, Some("healthcare"))
            .with(FilterDimension::Region, Some("emea"))
    }

    #[test]
    fn strict_query_prefers_section_filters_and_fills_from_context() {
        let spec = liability_section().with_filters(
            FilterSet::new()
                .with(FilterDimension::Industry, "finance")
                .with(FilterDimension::RiskLevel, "{{intake.risk_appetite}}"),
        );
        let query = build_strict_query(&spec, &context());
        assert_eq!(query.section, "Limitation of Liability");
        assert_eq!(
            query.filters.get(FilterDimension::Industry),
            Some(&FilterValue::from("finance"))
        );
        assert_eq!(
            query.filters.get(FilterDimension::Region),
            Some(&FilterValue::from("emea"))
        );
        assert!(!query.filters.contains(FilterDimension::RiskLevel));
    }

    #[test]
    fn relaxation_is_cumulative_and_skips_absent_dimensions() {
        let strict = build_strict_query(&liability_section(), &context());
        let plan = relaxation_plan(&strict, &FilterDimension::DEFAULT_RELAXATION);
        let relaxed: Vec<_> = plan.iter().map(|(r, _)| r.clone()).collect();
        assert_eq!(
            relaxed,
            vec![
                vec![],
                vec![FilterDimension::Tags],
                vec![FilterDimension::Tags, FilterDimension::Industry],
                vec![FilterDimension::Tags, FilterDimension::Industry, FilterDimension::Region],
            ]
        );
        assert_eq!(plan[3].1.filters.dimensions(), vec![FilterDimension::ClauseType]);
    }

    #[tokio::test]
    async fn stops_at_first_level_meeting_minimum() {
        // strict has 4 filters; dropping tags leaves 3, then industry leaves 2
        let backend = Arc::new(Tiered {
            by_filter_count: vec![9, 9, 6, 3, 2],
            calls: Calls::default(),
        });
        let engine = RetrievalEngine::new(backend.clone());
        let out = engine.retrieve(&liability_section(), &context()).await.unwrap();

        assert_eq!(out.status, EvidenceStatus::Satisfied);
        assert_eq!(out.candidates.len(), 6);
        assert_eq!(out.diagnostics.attempts.len(), 3);
        assert!(out.diagnostics.fallback_activated);
        assert_eq!(
            out.diagnostics.relaxed_dimensions,
            vec![FilterDimension::Tags, FilterDimension::Industry]
        );
        let counts: Vec<_> = out.diagnostics.attempts.iter().map(|a| a.deduped_count).collect();
        assert_eq!(counts, vec![2, 3, 6]);
        assert_eq!(backend.calls.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn empty_corpus_is_insufficient_evidence() {
        let backend = Arc::new(Tiered {
            by_filter_count: vec![],
            calls: Calls::default(),
        });
        let out = RetrievalEngine::new(backend)
            .retrieve(&liability_section(), &context())
            .await
            .unwrap();
        assert_eq!(out.status, EvidenceStatus::InsufficientEvidence);
        assert_eq!(out.diagnostics.attempts.len(), 4);
        assert_eq!(out.diagnostics.final_count, 0);
    }

    #[tokio::test]
    async fn runs_are_deterministic() {
        let run = || async {
            let backend = Arc::new(Tiered {
                by_filter_count: vec![1, 1, 4, 2, 1],
                calls: Calls::default(),
            });
            RetrievalEngine::new(backend)
                .retrieve(&liability_section(), &context())
                .await
                .unwrap()
        };
        let a = run().await;
        let b = run().await;
        assert_eq!(a.diagnostics, b.diagnostics);
        assert_eq!(a.candidates, b.candidates);
        assert_eq!(a.status, EvidenceStatus::BelowMinimum);
    }

    struct Down;

    #[async_trait]
    impl KnowledgeCapability for Down {
        async fn query(&self, _: &RetrievalQuery, _: usize) -> Result<Vec<KnowledgeHit>, KnowledgeError> {
            Err(KnowledgeError::Unavailable("index offline".into()))
        }

        async fn fetch_object(&self, _: &str) -> Result<Option<serde_json::Value>, KnowledgeError> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outage_surfaces_as_unavailable() {
        let engine = RetrievalEngine::new(Arc::new(Down)).with_retry(RetryPolicy::default().with_max_attempts(2));
        let err = engine.retrieve(&liability_section(), &context()).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Unavailable { attempts: 2, .. }));
    }

    fn any_order() -> impl Strategy<Value = Vec<FilterDimension>> {
        Just(FilterDimension::ALL.to_vec()).prop_shuffle().prop_flat_map(|dims| {
            let len = dims.len();
            (0..=len).prop_map(move |n| dims[..n].to_vec())
        })
    }

    proptest! {
        #[test]
        fn section_survives_every_relaxation(order in any_order(), name in "[A-Za-z ]{1,24}") {
            let mut filters = FilterSet::new();
            for dimension in FilterDimension::ALL {
                filters.insert(dimension, format!("{dimension}-value"));
            }
            let spec = SectionSpec::new(name.clone(), "").with_filters(filters);
            let strict = build_strict_query(&spec, &RetrievalContext::new());
            let plan = relaxation_plan(&strict, &order);

            prop_assert_eq!(plan.len(), order.len() + 1);
            for (relaxed, query) in &plan {
                prop_assert_eq!(&query.section, &name);
                for dimension in relaxed {
                    prop_assert!(!query.filters.contains(*dimension));
                }
            }
        }
    }
}
