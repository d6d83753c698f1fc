//! Retrieval error types

use std::time::Duration;

/// Failures reported by a knowledge capability
#[derive(Debug, Clone, thiserror::Error)]
pub enum KnowledgeError {
    /// The call did not complete in time
    #[error("knowledge query timed out after {0:?}")]
    Timeout(Duration),

    /// The backend is temporarily unreachable
    #[error("knowledge backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something unusable
    #[error("malformed knowledge response: {0}")]
    Malformed(String),

    /// The query was rejected
    #[error("knowledge query rejected: {0}")]
    Rejected(String),
}

impl KnowledgeError {
    /// Whether a retry may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KnowledgeError::Timeout(_) | KnowledgeError::Unavailable(_) | KnowledgeError::Malformed(_)
        )
    }
}

/// Errors from the retrieval engine
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    /// Retry budget exhausted against the knowledge capability
    #[error("retrieval unavailable for section '{section}' after {attempts} attempts: {last_error}")]
    Unavailable {
        section: String,
        attempts: u32,
        last_error: String,
    },

    /// The knowledge capability refused the query
    #[error("knowledge capability rejected query for section '{section}': {source}")]
    Knowledge {
        section: String,
        #[source]
        source: KnowledgeError,
    },

    /// Section specification violates an invariant
    #[error("invalid section '{section}': {reason}")]
    InvalidSection { section: String, reason: String },
}

/// Errors loading a local knowledge corpus
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}
