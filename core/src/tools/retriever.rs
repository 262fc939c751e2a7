use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::error::{ToolError, ToolResult};
use super::traits::{Tool, ToolOutcome};
use crate::retrieval::{HybridRetriever, RetrievalItem};

/// The retrieval tool the planner schedules: hybrid semantic + keyword
/// search over the turn's corpus scope.
///
/// Holds the turn's seen-id set (owned by the agent) so repeated calls
/// within one turn exclude evidence that was already surfaced. The tool
/// only reads the set; the agent merges new ids back after each call.
pub struct DocumentRetrieverTool {
    retriever: Arc<HybridRetriever>,
    seen: Arc<Mutex<HashSet<String>>>,
}

impl DocumentRetrieverTool {
    pub const NAME: &'static str = "document_retriever";

    pub fn new(retriever: Arc<HybridRetriever>, seen: Arc<Mutex<HashSet<String>>>) -> Self {
        Self { retriever, seen }
    }
}

#[async_trait]
impl Tool for DocumentRetrieverTool {
    fn name(&self) -> String {
        Self::NAME.to_string()
    }

    fn description(&self) -> String {
        "Retrieve relevant documents using hybrid search (semantic + keyword matching). \
         Combines vector similarity with BM25 keyword ranking. Use semantic_query for \
         conceptual searches and keyword_query for exact term matching."
            .to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "semantic_query": {
                    "type": "string",
                    "description": "Natural language query for semantic search"
                },
                "keyword_query": {
                    "type": "string",
                    "description": "Specific terms or phrases for keyword matching. Optional."
                }
            },
            "required": ["semantic_query"]
        })
    }

    async fn call(&self, arguments: Value) -> ToolResult<ToolOutcome> {
        let semantic_query = arguments
            .get("semantic_query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ToolError::InvalidArguments("semantic_query is required".to_string())
            })?
            .to_string();

        // The planner occasionally emits a list of strings here
        let keyword_query = match arguments.get("keyword_query") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(parts)) => Some(
                parts
                    .iter()
                    .map(|p| match p {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            _ => None,
        };

        let exclude = self.seen.lock().unwrap().clone();
        let outcome = self
            .retriever
            .retrieve(&semantic_query, keyword_query.as_deref(), &exclude)
            .await;

        let result = Value::Array(
            outcome
                .items
                .into_iter()
                .map(|item| match item {
                    RetrievalItem::Document(doc) => json!({
                        "text": doc.text,
                        "metadata": doc.metadata,
                    }),
                    RetrievalItem::Note(note) => Value::String(note),
                })
                .collect(),
        );

        Ok(ToolOutcome {
            result,
            seen_ids: outcome.seen_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{
        HybridRetrieverConfig, KeywordIndex, MetadataFilter, ScoredDocument, SearchScope,
        VectorIndex, WeightedTerm,
    };
    use crate::Result;
    use std::collections::HashMap;

    struct OneDocVector;

    #[async_trait]
    impl VectorIndex for OneDocVector {
        async fn search(
            &self,
            _query: &str,
            _top_k: usize,
            _filter: &MetadataFilter,
        ) -> Result<Vec<ScoredDocument>> {
            Ok(vec![ScoredDocument {
                id: "doc-1".into(),
                text: "retrieved text".into(),
                metadata: HashMap::new(),
                score: -0.2,
            }])
        }
    }

    struct EmptyKeyword;

    #[async_trait]
    impl KeywordIndex for EmptyKeyword {
        async fn search(
            &self,
            _terms: &[WeightedTerm],
            _top_k: usize,
            _scope: &SearchScope,
            _exclude: &[String],
        ) -> Result<Vec<ScoredDocument>> {
            Ok(Vec::new())
        }
    }

    fn tool() -> DocumentRetrieverTool {
        let retriever = Arc::new(HybridRetriever::new(
            Arc::new(OneDocVector),
            Arc::new(EmptyKeyword),
            None,
            SearchScope::Shared,
            HybridRetrieverConfig::default(),
        ));
        DocumentRetrieverTool::new(retriever, Arc::new(Mutex::new(HashSet::new())))
    }

    #[tokio::test]
    async fn test_requires_semantic_query() {
        let err = tool().call(json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn test_returns_documents_and_ids() {
        let outcome = tool()
            .call(json!({"semantic_query": "advisor requirements"}))
            .await
            .unwrap();

        assert!(outcome.seen_ids.contains("doc-1"));
        let items = outcome.result.as_array().unwrap();
        assert_eq!(items[0]["text"], "retrieved text");
    }

    #[tokio::test]
    async fn test_accepts_keyword_query_list() {
        let outcome = tool()
            .call(json!({
                "semantic_query": "q",
                "keyword_query": ["advisor", "requirements"]
            }))
            .await
            .unwrap();
        assert!(outcome.seen_ids.contains("doc-1"));
    }
}
