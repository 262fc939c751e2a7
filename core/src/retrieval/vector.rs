//! Vector (semantic) search seam and the Chroma REST adapter.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::filter::MetadataFilter;
use super::ScoredDocument;
use crate::{Result, SkeinError};

/// Semantic search seam. Implementations embed the query server-side and
/// return nearest chunks; adapters must normalize scores so higher is
/// better before handing documents back.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredDocument>>;
}

/// Configuration for the Chroma adapter
#[derive(Debug, Clone)]
pub struct ChromaConfig {
    pub base_url: String,
    pub collection: String,
    pub request_timeout_ms: u64,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("CHROMA_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:8010".to_string()),
            collection: std::env::var("CHROMA_COLLECTION")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "documents".to_string()),
            request_timeout_ms: std::env::var("CHROMA_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(10_000),
        }
    }
}

/// Chroma-style REST adapter. The collection's embedding function runs
/// server-side; this client only posts query text and a filter tree.
pub struct ChromaVectorIndex {
    http: Client,
    cfg: ChromaConfig,
}

impl ChromaVectorIndex {
    pub fn new(cfg: ChromaConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| SkeinError::Retrieval(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ChromaConfig::default())
    }

    fn query_url(&self) -> String {
        format!(
            "{}/api/v1/collections/{}/query",
            self.cfg.base_url.trim_end_matches('/'),
            self.cfg.collection
        )
    }
}

/// Chroma query response: one inner list per query text
#[derive(Debug, Deserialize)]
struct ChromaQueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Vec<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Vec<Vec<Option<HashMap<String, serde_json::Value>>>>,
    #[serde(default)]
    distances: Vec<Vec<f64>>,
}

#[async_trait]
impl VectorIndex for ChromaVectorIndex {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredDocument>> {
        let url = self.query_url();
        debug!(target: "vector_index", %url, top_k, "Vector query");

        let body = json!({
            "query_texts": [query],
            "n_results": top_k,
            "where": filter.to_query_json(),
            "include": ["documents", "metadatas", "distances"],
        });

        let resp = self.http.post(&url).json(&body).send().await.map_err(|e| {
            warn!(target: "vector_index", error = %e, "Vector query request failed");
            SkeinError::Retrieval(format!("Vector query request failed: {e}"))
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            warn!(target: "vector_index", %status, "Vector backend returned error");
            return Err(SkeinError::Retrieval(format!(
                "Vector backend returned status: {}",
                status
            )));
        }

        let parsed: ChromaQueryResponse = resp.json().await.map_err(|e| {
            SkeinError::Retrieval(format!("Failed to parse vector query response: {e}"))
        })?;

        Ok(response_to_documents(parsed))
    }
}

fn response_to_documents(resp: ChromaQueryResponse) -> Vec<ScoredDocument> {
    let ids = resp.ids.into_iter().next().unwrap_or_default();
    let mut documents = resp.documents.into_iter().next().unwrap_or_default();
    let mut metadatas = resp.metadatas.into_iter().next().unwrap_or_default();
    let distances = resp.distances.into_iter().next().unwrap_or_default();

    documents.resize(ids.len(), None);
    metadatas.resize(ids.len(), None);

    ids.into_iter()
        .enumerate()
        .map(|(i, id)| ScoredDocument {
            id,
            text: documents[i].take().unwrap_or_default(),
            metadata: metadatas[i].take().unwrap_or_default(),
            // The backend reports distance (lower is better); negate so
            // every retrieval source sorts descending by score.
            score: distances.get(i).map(|d| -d).unwrap_or(0.0),
        })
        .collect()
}
