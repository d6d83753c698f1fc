//! Content-fingerprint deduplication

use crate::candidate::ClauseCandidate;
use sow_artifact::ContentHash;
use std::collections::HashMap;

/// Whitespace-collapsed, case-folded text
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fingerprint over normalized text plus source lineage
#[must_use]
pub fn fingerprint(candidate: &ClauseCandidate) -> ContentHash {
    ContentHash::of_fields([
        normalize_text(&candidate.text).as_bytes(),
        candidate.lineage_id().as_bytes(),
    ])
}

/// Merge candidates that share a fingerprint
///
/// The highest-scored instance of each group survives (ties keep the first
/// seen) and records the other instances' source URIs. Output keeps the
/// order in which each group was first seen.
#[must_use]
pub fn dedupe(candidates: Vec<ClauseCandidate>) -> Vec<ClauseCandidate> {
    let mut slots: HashMap<ContentHash, usize> = HashMap::new();
    let mut groups: Vec<Vec<ClauseCandidate>> = Vec::new();

    for candidate in candidates {
        let key = fingerprint(&candidate);
        match slots.get(&key) {
            Some(&slot) => groups[slot].push(candidate),
            None => {
                slots.insert(key, groups.len());
                groups.push(vec![candidate]);
            }
        }
    }

    groups.into_iter().filter_map(merge_group).collect()
}

fn merge_group(group: Vec<ClauseCandidate>) -> Option<ClauseCandidate> {
    let best = group
        .iter()
        .enumerate()
        .fold(None::<(usize, f64)>, |best, (i, c)| match best {
            Some((_, score)) if c.score.total_cmp(&score).is_le() => best,
            _ => Some((i, c.score)),
        })
        .map(|(i, _)| i)?;

    let mut merged: Vec<String> = Vec::new();
    let mut survivor = None;
    for (i, candidate) in group.into_iter().enumerate() {
        if i == best {
            survivor = Some(candidate);
        } else {
            merged.push(candidate.source_uri);
            merged.extend(candidate.merged_sources);
        }
    }

    let mut survivor = survivor?;
    for uri in merged {
        if uri != survivor.source_uri && !survivor.merged_sources.contains(&uri) {
            survivor.merged_sources.push(uri);
        }
    }
    Some(survivor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::ChunkMetadata;

    fn candidate(id: &str, uri: &str, doc: Option<&str>, text: &str, score: f64) -> ClauseCandidate {
        ClauseCandidate {
            id: id.into(),
            source_uri: uri.into(),
            document_id: doc.map(str::to_string),
            title: None,
            text: text.into(),
            score,
            risk_level: None,
            metadata: ChunkMetadata::new(),
            provenance_confident: true,
            merged_sources: Vec::new(),
        }
    }

    #[test]
    fn text_normalization() {
        assert_eq!(normalize_text("  The  Supplier\n shall "), "the supplier shall");
    }

    #[test]
    fn merges_same_text_same_lineage_keeping_best_score() {
        let out = dedupe(vec![
            candidate("a", "kb://one", Some("msa-1"), "Liability is capped.", 0.4),
            candidate("b", "kb://two", Some("msa-1"), "liability   is CAPPED.", 0.9),
            candidate("c", "kb://three", Some("msa-2"), "Liability is capped.", 0.5),
        ]);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "b");
        assert_eq!(out[0].merged_sources, vec!["kb://one".to_string()]);
        assert_eq!(out[1].id, "c");
        assert!(out[1].merged_sources.is_empty());
    }

    #[test]
    fn ties_keep_first_seen() {
        let out = dedupe(vec![
            candidate("first", "kb://x", None, "Same clause", 0.5),
            candidate("second", "kb://x", None, "same clause", 0.5),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "first");
        assert!(out[0].merged_sources.is_empty());
    }
}
