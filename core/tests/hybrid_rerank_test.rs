//! Per-branch reranking behavior of the hybrid retriever.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skein_core::retrieval::{
    HybridRetriever, HybridRetrieverConfig, KeywordIndex, MetadataFilter, RerankClient, Reranker,
    RetrievalItem, ScoredDocument, SearchScope, VectorIndex, WeightedTerm,
};
use skein_core::Result;

fn doc(id: &str, score: f64) -> ScoredDocument {
    ScoredDocument {
        id: id.to_string(),
        text: format!("text {}", id),
        metadata: HashMap::new(),
        score,
    }
}

struct FixedVector(Vec<ScoredDocument>);

#[async_trait]
impl VectorIndex for FixedVector {
    async fn search(
        &self,
        _query: &str,
        _top_k: usize,
        _filter: &MetadataFilter,
    ) -> Result<Vec<ScoredDocument>> {
        Ok(self.0.clone())
    }
}

struct FixedKeyword(Vec<ScoredDocument>);

#[async_trait]
impl KeywordIndex for FixedKeyword {
    async fn search(
        &self,
        _terms: &[WeightedTerm],
        _top_k: usize,
        _scope: &SearchScope,
        _exclude: &[String],
    ) -> Result<Vec<ScoredDocument>> {
        Ok(self.0.clone())
    }
}

/// Records every rerank query and scores documents in reverse order
struct RecordingRerank {
    queries: Mutex<Vec<String>>,
}

impl RecordingRerank {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RerankClient for RecordingRerank {
    async fn scores(&self, query: &str, documents: &[String]) -> Result<Vec<f64>> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok((0..documents.len()).map(|i| i as f64).collect())
    }
}

fn ids(items: &[RetrievalItem]) -> Vec<String> {
    items
        .iter()
        .filter_map(|i| match i {
            RetrievalItem::Document(d) => Some(d.id.clone()),
            RetrievalItem::Note(_) => None,
        })
        .collect()
}

#[tokio::test]
async fn test_branches_rerank_against_their_own_queries() {
    let rerank = RecordingRerank::new();
    let reranker = Arc::new(Reranker::new(rerank.clone(), 5, 10));

    let retriever = HybridRetriever::new(
        Arc::new(FixedVector(vec![doc("v1", -0.1), doc("v2", -0.2)])),
        Arc::new(FixedKeyword(vec![doc("k1", 2.0)])),
        Some(reranker),
        SearchScope::Shared,
        HybridRetrieverConfig {
            top_k: 10,
            branch_timeout: Duration::from_secs(5),
            shared_owner: "shared".into(),
        },
    );

    retriever
        .retrieve(
            "what the handbook says about advisors",
            Some("advisor requirements"),
            &HashSet::new(),
        )
        .await;

    let queries = rerank.queries.lock().unwrap();
    assert_eq!(queries.len(), 2);
    // Each branch reranks against its own query text, never the other's
    assert!(queries.contains(&"what the handbook says about advisors".to_string()));
    assert!(queries.contains(&"advisor requirements".to_string()));
}

#[tokio::test]
async fn test_rerank_reorders_within_branch_only() {
    let rerank = RecordingRerank::new();
    let reranker = Arc::new(Reranker::new(rerank, 5, 10));

    let retriever = HybridRetriever::new(
        Arc::new(FixedVector(vec![doc("v1", -0.1), doc("v2", -0.2)])),
        Arc::new(FixedKeyword(vec![doc("k1", 2.0), doc("k2", 1.0)])),
        Some(reranker),
        SearchScope::Shared,
        HybridRetrieverConfig {
            top_k: 10,
            branch_timeout: Duration::from_secs(5),
            shared_owner: "shared".into(),
        },
    );

    let outcome = retriever
        .retrieve("semantic", Some("advisor requirements"), &HashSet::new())
        .await;

    // RecordingRerank scores later documents higher, so each branch is
    // reversed, but the branches stay concatenated: vector first
    assert_eq!(ids(&outcome.items), vec!["v2", "v1", "k2", "k1"]);
}

#[tokio::test]
async fn test_merged_list_not_globally_sorted() {
    // No reranker: raw branch scores are on different scales and the
    // merged list intentionally preserves branch order
    let retriever = HybridRetriever::new(
        Arc::new(FixedVector(vec![doc("v1", -0.5)])),
        Arc::new(FixedKeyword(vec![doc("k1", 9.0)])),
        None,
        SearchScope::Shared,
        HybridRetrieverConfig {
            top_k: 10,
            branch_timeout: Duration::from_secs(5),
            shared_owner: "shared".into(),
        },
    );

    let outcome = retriever
        .retrieve("semantic", Some("advisor requirements"), &HashSet::new())
        .await;

    // k1 outscores v1 but still comes second
    assert_eq!(ids(&outcome.items), vec!["v1", "k1"]);
}
