//! Relevance reranking with a deterministic fallback.
//!
//! Candidates are scored by an external endpoint and reordered; when the
//! endpoint is unreachable or returns garbage the pipeline degrades to
//! the candidates' own scores, bounded by a distinct (larger) fallback
//! count. `Reranker::rerank` never fails the turn.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::ScoredDocument;
use crate::{Result, SkeinError};

/// Scoring-endpoint seam: relevance score per document, document order
/// preserved.
#[async_trait]
pub trait RerankClient: Send + Sync {
    async fn scores(&self, query: &str, documents: &[String]) -> Result<Vec<f64>>;
}

/// Configuration for the HTTP reranking endpoint
#[derive(Debug, Clone)]
pub struct HttpRerankerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    /// Task instruction embedded in the scoring prompt
    pub instruction: String,
}

impl Default for HttpRerankerConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("RERANKER_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:6767".to_string()),
            api_key: std::env::var("RERANKER_API_KEY").ok().filter(|s| !s.is_empty()),
            request_timeout_ms: std::env::var("RERANKER_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(10_000),
            instruction: "Given a search query, retrieve relevant candidates that answer the query."
                .to_string(),
        }
    }
}

/// vLLM-style `/v1/rerank` client.
pub struct HttpReranker {
    http: Client,
    cfg: HttpRerankerConfig,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f64,
}

impl HttpReranker {
    pub fn new(cfg: HttpRerankerConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| SkeinError::Retrieval(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(HttpRerankerConfig::default())
    }
}

#[async_trait]
impl RerankClient for HttpReranker {
    async fn scores(&self, query: &str, documents: &[String]) -> Result<Vec<f64>> {
        let url = format!("{}/v1/rerank", self.cfg.base_url.trim_end_matches('/'));
        debug!(target: "reranker", %url, documents = documents.len(), "Rerank request");

        let body = json!({
            "query": format!("<Instruct>: {}\n<Query>: {}\n", self.cfg.instruction, query),
            "documents": documents,
        });

        let mut req = self.http.post(&url).json(&body);
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SkeinError::Retrieval(format!("Rerank request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(SkeinError::Retrieval(format!(
                "Rerank endpoint returned status: {}",
                resp.status()
            )));
        }

        let parsed: RerankResponse = resp
            .json()
            .await
            .map_err(|e| SkeinError::Retrieval(format!("Failed to parse rerank response: {e}")))?;

        // Scores come back keyed by original index, not by position
        let mut results = parsed.results;
        results.sort_by_key(|r| r.index);
        Ok(results.into_iter().map(|r| r.relevance_score).collect())
    }
}

/// Reorders candidates by endpoint relevance, degrading to original
/// scores on failure.
pub struct Reranker {
    client: Arc<dyn RerankClient>,
    top_n: usize,
    backup_top_n: usize,
}

impl Reranker {
    pub fn new(client: Arc<dyn RerankClient>, top_n: usize, backup_top_n: usize) -> Self {
        Self {
            client,
            top_n,
            backup_top_n,
        }
    }

    /// Rerank `candidates` against `query`. On endpoint failure (or a
    /// score-count mismatch) falls back to the candidates sorted by
    /// their pre-existing score, truncated to `backup_top_n`. Never
    /// returns an error.
    pub async fn rerank(
        &self,
        mut candidates: Vec<ScoredDocument>,
        query: &str,
    ) -> Vec<ScoredDocument> {
        if candidates.is_empty() {
            return candidates;
        }

        let documents: Vec<String> = candidates.iter().map(|d| d.text.clone()).collect();
        match self.client.scores(query, &documents).await {
            Ok(scores) if scores.len() == candidates.len() => {
                for (doc, score) in candidates.iter_mut().zip(scores) {
                    doc.score = score;
                }
                sort_by_score_desc(&mut candidates);
                candidates.truncate(self.top_n);
                candidates
            }
            Ok(scores) => {
                warn!(
                    target: "reranker",
                    expected = candidates.len(),
                    got = scores.len(),
                    "Score count mismatch; falling back to retrieval order"
                );
                self.fallback(candidates)
            }
            Err(e) => {
                warn!(target: "reranker", error = %e, "Rerank failed; falling back to retrieval order");
                self.fallback(candidates)
            }
        }
    }

    fn fallback(&self, mut candidates: Vec<ScoredDocument>) -> Vec<ScoredDocument> {
        sort_by_score_desc(&mut candidates);
        candidates.truncate(self.backup_top_n);
        candidates
    }
}

fn sort_by_score_desc(docs: &mut [ScoredDocument]) {
    docs.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
