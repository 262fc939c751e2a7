//! LLM module: completion seam and OpenAI-compatible HTTP client
//!
//! Every agent step (planning, judging, rewriting, synthesis) and both
//! memory compressors call through the single `LlmClient` trait; the
//! shipped implementation talks to an OpenAI-compatible backend.

mod client;

pub use client::{HttpLlmClient, LlmClientConfig};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;

/// A single completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Optional system prompt
    pub system: Option<String>,
    /// User-visible prompt body
    pub prompt: String,
    /// Cap on generated tokens; backend default when `None`
    pub max_tokens: Option<u32>,
    /// Sampling temperature; backend default when `None`
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Stream of generated text increments. The channel closing cleanly marks
/// the end of generation; an `Err` item reports a mid-stream failure.
pub type CompletionChunks = mpsc::Receiver<Result<String>>;

/// Narrow completion seam over the serving backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate the full completion as one string
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Generate a completion as a stream of text increments.
    ///
    /// The default implementation degrades to a single-chunk stream so
    /// non-streaming backends (and test doubles) satisfy the trait.
    async fn complete_stream(&self, request: CompletionRequest) -> Result<CompletionChunks> {
        let text = self.complete(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.send(Ok(text)).await;
        Ok(rx)
    }
}
