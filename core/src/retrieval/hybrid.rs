//! Hybrid retrieval: concurrent vector + keyword search with per-branch
//! reranking.
//!
//! The two branches run as independent tasks, each under its own
//! timeout; a timeout or error in one branch degrades that branch to an
//! in-band diagnostic note and never cancels the other. Results are
//! concatenated per branch order — branch scores are not comparable, so
//! no global re-sort is attempted; downstream synthesis treats order as
//! advisory.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::filter::vector_filter;
use super::keyword::{build_weighted_terms, extract_keywords, KeywordIndex};
use super::rerank::Reranker;
use super::vector::VectorIndex;
use super::{ScoredDocument, SearchScope};

/// Configuration for a hybrid retriever
#[derive(Debug, Clone)]
pub struct HybridRetrieverConfig {
    /// Candidates requested from each branch
    pub top_k: usize,
    /// Per-branch timeout
    pub branch_timeout: Duration,
    /// Owner tag of the shared corpus
    pub shared_owner: String,
}

impl Default for HybridRetrieverConfig {
    fn default() -> Self {
        Self {
            top_k: 25,
            branch_timeout: Duration::from_secs(5),
            shared_owner: "shared".to_string(),
        }
    }
}

/// One element of a retrieval result: a document, or a diagnostic the
/// agent can reason about in-band (timeouts, backend failures).
#[derive(Debug, Clone)]
pub enum RetrievalItem {
    Document(ScoredDocument),
    Note(String),
}

/// What a retrieval call produced
#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    pub items: Vec<RetrievalItem>,
    /// Ids of every document returned, for the caller's exclusion set
    pub seen_ids: HashSet<String>,
}

/// Runs semantic and keyword search concurrently over one corpus scope.
pub struct HybridRetriever {
    vector: Arc<dyn VectorIndex>,
    keyword: Arc<dyn KeywordIndex>,
    reranker: Option<Arc<Reranker>>,
    scope: SearchScope,
    cfg: HybridRetrieverConfig,
}

impl HybridRetriever {
    pub fn new(
        vector: Arc<dyn VectorIndex>,
        keyword: Arc<dyn KeywordIndex>,
        reranker: Option<Arc<Reranker>>,
        scope: SearchScope,
        cfg: HybridRetrieverConfig,
    ) -> Self {
        Self {
            vector,
            keyword,
            reranker,
            scope,
            cfg,
        }
    }

    /// Retrieve documents for a semantic query and an optional keyword
    /// query, excluding previously seen ids at the backend. Failures
    /// degrade to partial results plus diagnostic notes; this never
    /// returns an error.
    pub async fn retrieve(
        &self,
        semantic_query: &str,
        keyword_query: Option<&str>,
        exclude: &HashSet<String>,
    ) -> RetrievalOutcome {
        let exclude: Vec<String> = exclude.iter().cloned().collect();

        let vector_task = tokio::spawn(Self::vector_branch(
            self.vector.clone(),
            self.reranker.clone(),
            semantic_query.to_string(),
            self.scope.clone(),
            self.cfg.clone(),
            exclude.clone(),
        ));

        let keyword_query = keyword_query.map(|q| q.to_string()).filter(|q| !q.is_empty());
        let keyword_task = keyword_query.map(|query| {
            tokio::spawn(Self::keyword_branch(
                self.keyword.clone(),
                self.reranker.clone(),
                query,
                self.scope.clone(),
                self.cfg.clone(),
                exclude,
            ))
        });

        let mut items = match vector_task.await {
            Ok(items) => items,
            Err(e) => vec![RetrievalItem::Note(format!("Vector retrieval failed: {e}"))],
        };
        if let Some(task) = keyword_task {
            match task.await {
                Ok(branch) => items.extend(branch),
                Err(e) => items.push(RetrievalItem::Note(format!(
                    "Keyword retrieval failed: {e}"
                ))),
            }
        }

        let seen_ids: HashSet<String> = items
            .iter()
            .filter_map(|item| match item {
                RetrievalItem::Document(doc) => Some(doc.id.clone()),
                RetrievalItem::Note(_) => None,
            })
            .collect();

        debug!(
            target: "hybrid_retriever",
            documents = seen_ids.len(),
            items = items.len(),
            "Hybrid retrieval complete"
        );

        RetrievalOutcome { items, seen_ids }
    }

    async fn vector_branch(
        vector: Arc<dyn VectorIndex>,
        reranker: Option<Arc<Reranker>>,
        query: String,
        scope: SearchScope,
        cfg: HybridRetrieverConfig,
        exclude: Vec<String>,
    ) -> Vec<RetrievalItem> {
        let filter = vector_filter(&scope, &cfg.shared_owner, &exclude);
        match timeout(cfg.branch_timeout, vector.search(&query, cfg.top_k, &filter)).await {
            Ok(Ok(docs)) => {
                let docs = match &reranker {
                    Some(r) => r.rerank(docs, &query).await,
                    None => docs,
                };
                docs.into_iter().map(RetrievalItem::Document).collect()
            }
            Ok(Err(e)) => {
                warn!(target: "hybrid_retriever", error = %e, "Vector branch failed");
                vec![RetrievalItem::Note(format!("Vector retrieval failed: {e}"))]
            }
            Err(_) => {
                warn!(target: "hybrid_retriever", "Vector branch timed out");
                vec![RetrievalItem::Note(format!(
                    "Vector retriever timeout: query exceeded {:?}",
                    cfg.branch_timeout
                ))]
            }
        }
    }

    async fn keyword_branch(
        keyword: Arc<dyn KeywordIndex>,
        reranker: Option<Arc<Reranker>>,
        query: String,
        scope: SearchScope,
        cfg: HybridRetrieverConfig,
        exclude: Vec<String>,
    ) -> Vec<RetrievalItem> {
        let keywords = extract_keywords(&query);
        if keywords.is_empty() {
            return vec![RetrievalItem::Note(
                "Keyword query contained no searchable terms".to_string(),
            )];
        }
        let terms = build_weighted_terms(&keywords);

        match timeout(
            cfg.branch_timeout,
            keyword.search(&terms, cfg.top_k, &scope, &exclude),
        )
        .await
        {
            Ok(Ok(docs)) => {
                let docs = match &reranker {
                    Some(r) => r.rerank(docs, &query).await,
                    None => docs,
                };
                docs.into_iter().map(RetrievalItem::Document).collect()
            }
            Ok(Err(e)) => {
                warn!(target: "hybrid_retriever", error = %e, "Keyword branch failed");
                vec![RetrievalItem::Note(format!("Keyword retrieval failed: {e}"))]
            }
            Err(_) => {
                warn!(target: "hybrid_retriever", "Keyword branch timed out");
                vec![RetrievalItem::Note(format!(
                    "Keyword retriever timeout: query exceeded {:?}",
                    cfg.branch_timeout
                ))]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::filter::MetadataFilter;
    use crate::retrieval::keyword::WeightedTerm;
    use crate::{Result, SkeinError};
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn doc(id: &str, score: f64) -> ScoredDocument {
        ScoredDocument {
            id: id.to_string(),
            text: format!("text {}", id),
            metadata: HashMap::new(),
            score,
        }
    }

    /// Returns fixed documents, honoring the exclusion filter
    struct FakeVector(Vec<ScoredDocument>);

    #[async_trait]
    impl VectorIndex for FakeVector {
        async fn search(
            &self,
            _query: &str,
            top_k: usize,
            filter: &MetadataFilter,
        ) -> Result<Vec<ScoredDocument>> {
            let excluded = collect_nin(filter);
            Ok(self
                .0
                .iter()
                .filter(|d| !excluded.contains(&d.id))
                .take(top_k)
                .cloned()
                .collect())
        }
    }

    fn collect_nin(filter: &MetadataFilter) -> Vec<String> {
        match filter {
            MetadataFilter::NotIn(_, ids) => ids.clone(),
            MetadataFilter::And(parts) | MetadataFilter::Or(parts) => {
                parts.iter().flat_map(collect_nin).collect()
            }
            _ => Vec::new(),
        }
    }

    struct FakeKeyword(Vec<ScoredDocument>);

    #[async_trait]
    impl KeywordIndex for FakeKeyword {
        async fn search(
            &self,
            _terms: &[WeightedTerm],
            top_k: usize,
            _scope: &SearchScope,
            exclude: &[String],
        ) -> Result<Vec<ScoredDocument>> {
            Ok(self
                .0
                .iter()
                .filter(|d| !exclude.contains(&d.id))
                .take(top_k)
                .cloned()
                .collect())
        }
    }

    struct HangingVector;

    #[async_trait]
    impl VectorIndex for HangingVector {
        async fn search(
            &self,
            _query: &str,
            _top_k: usize,
            _filter: &MetadataFilter,
        ) -> Result<Vec<ScoredDocument>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    struct FailingKeyword;

    #[async_trait]
    impl KeywordIndex for FailingKeyword {
        async fn search(
            &self,
            _terms: &[WeightedTerm],
            _top_k: usize,
            _scope: &SearchScope,
            _exclude: &[String],
        ) -> Result<Vec<ScoredDocument>> {
            Err(SkeinError::Retrieval("index offline".into()))
        }
    }

    fn retriever(
        vector: Arc<dyn VectorIndex>,
        keyword: Arc<dyn KeywordIndex>,
        branch_timeout: Duration,
    ) -> HybridRetriever {
        HybridRetriever::new(
            vector,
            keyword,
            None,
            SearchScope::Shared,
            HybridRetrieverConfig {
                top_k: 10,
                branch_timeout,
                shared_owner: "shared".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_both_branches_merge() {
        let r = retriever(
            Arc::new(FakeVector(vec![doc("v1", -0.1), doc("v2", -0.2)])),
            Arc::new(FakeKeyword(vec![doc("k1", 2.0)])),
            Duration::from_secs(5),
        );

        let outcome = r.retrieve("semantic", Some("advisor requirements"), &HashSet::new()).await;
        assert_eq!(outcome.seen_ids.len(), 3);
        // Vector branch results come first
        assert!(matches!(&outcome.items[0], RetrievalItem::Document(d) if d.id == "v1"));
    }

    #[tokio::test]
    async fn test_keyword_branch_skipped_without_query() {
        let r = retriever(
            Arc::new(FakeVector(vec![doc("v1", -0.1)])),
            Arc::new(FailingKeyword),
            Duration::from_secs(5),
        );

        let outcome = r.retrieve("semantic", None, &HashSet::new()).await;
        assert_eq!(outcome.seen_ids.len(), 1);
        assert_eq!(outcome.items.len(), 1);
    }

    #[tokio::test]
    async fn test_exclusion_pushed_to_backends() {
        let r = retriever(
            Arc::new(FakeVector(vec![doc("v1", -0.1), doc("v2", -0.2)])),
            Arc::new(FakeKeyword(vec![doc("k1", 2.0), doc("k2", 1.0)])),
            Duration::from_secs(5),
        );

        let exclude: HashSet<String> = ["v1".to_string(), "k2".to_string()].into();
        let outcome = r.retrieve("semantic", Some("advisor requirements"), &exclude).await;

        assert!(!outcome.seen_ids.contains("v1"));
        assert!(!outcome.seen_ids.contains("k2"));
        assert_eq!(outcome.seen_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_isolates_branches() {
        let r = retriever(
            Arc::new(HangingVector),
            Arc::new(FakeKeyword(vec![doc("k1", 2.0)])),
            Duration::from_millis(50),
        );

        let outcome = r.retrieve("semantic", Some("advisor requirements"), &HashSet::new()).await;

        // Vector branch degraded to a note; keyword branch still delivered
        assert!(outcome
            .items
            .iter()
            .any(|i| matches!(i, RetrievalItem::Note(n) if n.contains("timeout"))));
        assert!(outcome.seen_ids.contains("k1"));
    }

    #[tokio::test]
    async fn test_backend_error_becomes_note() {
        let r = retriever(
            Arc::new(FakeVector(vec![doc("v1", -0.1)])),
            Arc::new(FailingKeyword),
            Duration::from_secs(5),
        );

        let outcome = r.retrieve("semantic", Some("advisor requirements"), &HashSet::new()).await;
        assert!(outcome
            .items
            .iter()
            .any(|i| matches!(i, RetrievalItem::Note(n) if n.contains("index offline"))));
        assert!(outcome.seen_ids.contains("v1"));
    }

    #[tokio::test]
    async fn test_empty_keyword_terms_note() {
        let r = retriever(
            Arc::new(FakeVector(vec![])),
            Arc::new(FakeKeyword(vec![doc("k1", 1.0)])),
            Duration::from_secs(5),
        );

        // Query collapses to nothing after stopword filtering
        let outcome = r.retrieve("semantic", Some("is the of a"), &HashSet::new()).await;
        assert!(outcome
            .items
            .iter()
            .any(|i| matches!(i, RetrievalItem::Note(n) if n.contains("no searchable terms"))));
    }
}
