//! Hybrid document retrieval
//!
//! Semantic (vector) and lexical (keyword) search seams, per-branch
//! reranking with a deterministic fallback, corpus scoping, and the
//! `HybridRetriever` that runs both branches concurrently under
//! independent timeouts.

mod filter;
mod hybrid;
mod keyword;
mod rerank;
mod vector;

pub use filter::{keyword_scope_clause, vector_filter, MetadataFilter};
pub use hybrid::{HybridRetriever, HybridRetrieverConfig, RetrievalItem, RetrievalOutcome};
pub use keyword::{
    build_weighted_terms, extract_keywords, KeywordIndex, RedisKeywordIndex,
    RedisKeywordIndexConfig, WeightedTerm,
};
pub use rerank::{HttpReranker, HttpRerankerConfig, RerankClient, Reranker};
pub use vector::{ChromaConfig, ChromaVectorIndex, VectorIndex};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Result, SkeinError};

/// A retrieved document chunk with a relevance score.
///
/// `id` is the deduplication key across agent iterations. Scores are
/// normalized so that higher is always better, whatever the backend
/// (vector adapters negate distances; BM25 and rerank scores already
/// comply). Sort direction is therefore uniform across sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub score: f64,
}

/// Which corpus a retrieval call is scoped to.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchScope {
    /// The default shared corpus (mode 0)
    Shared,
    /// A named user's private file set (mode 1)
    UserFiles { user_id: String, files: Vec<String> },
    /// Union of the shared corpus and the user's files (mode 2)
    Combined { user_id: String, files: Vec<String> },
}

impl SearchScope {
    /// Build a scope from the numeric search mode, validating before any
    /// backend is contacted. Modes 1 and 2 require a non-empty file list.
    pub fn from_mode(mode: u8, user_id: &str, files: &[String]) -> Result<Self> {
        match mode {
            0 => Ok(SearchScope::Shared),
            1 | 2 => {
                if files.is_empty() {
                    return Err(SkeinError::InvalidInput(format!(
                        "search_mode {} requires a non-empty file list",
                        mode
                    )));
                }
                let user_id = user_id.to_string();
                let files = files.to_vec();
                if mode == 1 {
                    Ok(SearchScope::UserFiles { user_id, files })
                } else {
                    Ok(SearchScope::Combined { user_id, files })
                }
            }
            _ => Err(SkeinError::InvalidInput(format!(
                "Invalid search_mode: {}. Must be between 0 and 2.",
                mode
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_zero_is_shared() {
        let scope = SearchScope::from_mode(0, "alice", &[]).unwrap();
        assert_eq!(scope, SearchScope::Shared);
    }

    #[test]
    fn test_mode_one_requires_files() {
        let err = SearchScope::from_mode(1, "alice", &[]).unwrap_err();
        assert!(matches!(err, SkeinError::InvalidInput(_)));

        let files = vec!["notes.pdf".to_string()];
        let scope = SearchScope::from_mode(1, "alice", &files).unwrap();
        assert!(matches!(scope, SearchScope::UserFiles { .. }));
    }

    #[test]
    fn test_mode_out_of_range() {
        let err = SearchScope::from_mode(3, "alice", &[]).unwrap_err();
        assert!(matches!(err, SkeinError::InvalidInput(_)));
    }
}
