//! Raw hit to clause candidate conversion

use crate::candidate::ClauseCandidate;
use crate::knowledge::{KnowledgeCapability, KnowledgeHit};
use serde::{Deserialize, Serialize};
use sow_artifact::ContentHash;

/// Why a hit was dropped before it became a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// No resolvable source URI
    MissingSource,
    /// Text empty or under the minimum length after both paths
    TextTooShort,
    /// Chunk indexed under a different section
    ForeignSection,
    /// Stored-object fetch failed
    FetchFailed,
}

/// Result of normalizing one hit
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Candidate(ClauseCandidate),
    Discarded(DiscardReason),
}

/// Converts knowledge hits into clause candidates
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    min_chars: usize,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self { min_chars: 20 }
    }
}

impl Normalizer {
    /// Normalizer requiring at least `min_chars` of text
    #[inline]
    #[must_use]
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }

    /// Minimum text length
    #[inline]
    #[must_use]
    pub fn min_chars(&self) -> usize {
        self.min_chars
    }

    /// Normalize one hit for `section`
    ///
    /// Citation text is preferred; without it the stored object behind the
    /// source URI is fetched and its text extracted, and the candidate is
    /// marked as not provenance-confident.
    pub async fn normalize(
        &self,
        section: &str,
        hit: KnowledgeHit,
        knowledge: &dyn KnowledgeCapability,
    ) -> Normalized {
        let Some(source_uri) = hit
            .source_uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .map(str::to_string)
        else {
            return Normalized::Discarded(DiscardReason::MissingSource);
        };

        if let Some(indexed) = hit.metadata.section() {
            if !indexed.trim().eq_ignore_ascii_case(section.trim()) {
                return Normalized::Discarded(DiscardReason::ForeignSection);
            }
        }

        let citation = hit
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        let (text, provenance_confident) = match citation {
            Some(text) => (text, true),
            None => match knowledge.fetch_object(&source_uri).await {
                Ok(Some(object)) => (extract_text(&object).unwrap_or_default(), false),
                Ok(None) => (String::new(), false),
                Err(e) => {
                    tracing::warn!(source_uri = %source_uri, error = %e, "stored object fetch failed");
                    return Normalized::Discarded(DiscardReason::FetchFailed);
                }
            },
        };

        if text.chars().count() < self.min_chars.max(1) {
            return Normalized::Discarded(DiscardReason::TextTooShort);
        }

        let id = hit
            .chunk_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map_or_else(
                || format!("uri-{}", ContentHash::of(source_uri.as_bytes()).short()),
                str::to_string,
            );

        Normalized::Candidate(ClauseCandidate {
            id,
            source_uri,
            document_id: hit.document_id,
            title: hit.title,
            text,
            score: hit.score,
            risk_level: hit.metadata.risk_level(),
            metadata: hit.metadata,
            provenance_confident,
            merged_sources: Vec::new(),
        })
    }
}

/// Pull text out of a fetched stored object
///
/// Strings are taken as-is; objects are searched for `text`, `content`,
/// `clause_text` or `body`, recursing one level into `data`.
#[must_use]
pub fn extract_text(object: &serde_json::Value) -> Option<String> {
    match object {
        serde_json::Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        serde_json::Value::Object(map) => ["text", "content", "clause_text", "body"]
            .iter()
            .find_map(|key| map.get(*key).and_then(serde_json::Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| map.get("data").and_then(extract_text)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KnowledgeError;
    use crate::filters::RetrievalQuery;
    use crate::knowledge::ChunkMetadata;
    use async_trait::async_trait;
    use serde_json::json;

    struct Objects;

    #[async_trait]
    impl KnowledgeCapability for Objects {
        async fn query(&self, _: &RetrievalQuery, _: usize) -> Result<Vec<KnowledgeHit>, KnowledgeError> {
            Ok(Vec::new())
        }

        async fn fetch_object(&self, uri: &str) -> Result<Option<serde_json::Value>, KnowledgeError> {
            match uri {
                "kb://stored" => Ok(Some(json!({"data": {"text": "Stored clause text recovered from the bucket."}}))),
                "kb://down" => Err(KnowledgeError::Unavailable("bucket offline".into())),
                _ => Ok(None),
            }
        }
    }

    fn hit(uri: Option<&str>, text: Option<&str>) -> KnowledgeHit {
        KnowledgeHit {
            chunk_id: Some("c-1".into()),
            source_uri: uri.map(str::to_string),
            text: text.map(str::to_string),
            score: 0.9,
            metadata: ChunkMetadata::new().with("section", "Scope"),
            ..KnowledgeHit::default()
        }
    }

    #[tokio::test]
    async fn citation_text_is_confident() {
        let out = Normalizer::new(10)
            .normalize("Scope", hit(Some("kb://a"), Some("  The supplier delivers the platform.  ")), &Objects)
            .await;
        let Normalized::Candidate(c) = out else { panic!("expected candidate") };
        assert!(c.provenance_confident);
        assert_eq!(c.text, "The supplier delivers the platform.");
        assert_eq!(c.id, "c-1");
    }

    #[tokio::test]
    async fn fetch_fallback_is_not_confident() {
        let out = Normalizer::new(10)
            .normalize("scope", hit(Some("kb://stored"), None), &Objects)
            .await;
        let Normalized::Candidate(c) = out else { panic!("expected candidate") };
        assert!(!c.provenance_confident);
        assert!(c.text.starts_with("Stored clause"));
    }

    #[tokio::test]
    async fn discards_without_source_or_text() {
        let n = Normalizer::new(10);
        assert_eq!(
            n.normalize("Scope", hit(None, Some("long enough text here")), &Objects).await,
            Normalized::Discarded(DiscardReason::MissingSource)
        );
        assert_eq!(
            n.normalize("Scope", hit(Some("kb://missing"), None), &Objects).await,
            Normalized::Discarded(DiscardReason::TextTooShort)
        );
        assert_eq!(
            n.normalize("Scope", hit(Some("kb://a"), Some("short")), &Objects).await,
            Normalized::Discarded(DiscardReason::TextTooShort)
        );
        assert_eq!(
            n.normalize("Scope", hit(Some("kb://down"), None), &Objects).await,
            Normalized::Discarded(DiscardReason::FetchFailed)
        );
    }

    #[tokio::test]
    async fn foreign_section_is_discarded() {
        let out = Normalizer::new(5)
            .normalize("Payment Terms", hit(Some("kb://a"), Some("some clause text")), &Objects)
            .await;
        assert_eq!(out, Normalized::Discarded(DiscardReason::ForeignSection));
    }

    #[tokio::test]
    async fn missing_chunk_id_derives_from_uri() {
        let mut h = hit(Some("kb://a"), Some("The supplier delivers the platform."));
        h.chunk_id = None;
        let Normalized::Candidate(a) = Normalizer::new(5).normalize("Scope", h.clone(), &Objects).await else {
            panic!("expected candidate")
        };
        let Normalized::Candidate(b) = Normalizer::new(5).normalize("Scope", h, &Objects).await else {
            panic!("expected candidate")
        };
        assert!(a.id.starts_with("uri-"));
        assert_eq!(a.id, b.id);
    }
}
