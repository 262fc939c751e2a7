use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{CompletionChunks, CompletionRequest, LlmClient};
use crate::{Result, SkeinError};

/// Configuration for HttpLlmClient loaded from environment variables
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub base_url: String, // e.g., http://localhost:8000/v1
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub temperature: f32,
}

impl Default for LlmClientConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("LLM_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            model: std::env::var("LLM_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "qwen2.5-7b-instruct".to_string()),
            api_key: std::env::var("LLM_API_KEY").ok().filter(|s| !s.is_empty()),
            request_timeout_ms: std::env::var("LLM_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(60_000),
            temperature: std::env::var("LLM_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse::<f32>().ok())
                .unwrap_or(0.7),
        }
    }
}

/// HTTP client for OpenAI-compatible Chat Completions backends
#[derive(Clone)]
pub struct HttpLlmClient {
    http: Client,
    cfg: LlmClientConfig,
}

impl HttpLlmClient {
    pub fn new(cfg: LlmClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| SkeinError::Llm(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(LlmClientConfig::default())
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        )
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "temperature": request.temperature.unwrap_or(self.cfg.temperature),
            "stream": stream,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }

    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(self.chat_url())
            .header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }
        req.json(body)
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        debug!(target: "llm_client", url = %self.chat_url(), "POST chat completion");

        let resp = self
            .request(&self.build_body(&request, false))
            .send()
            .await
            .map_err(|e| SkeinError::Llm(format!("Chat Completions HTTP error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(target: "llm_client", %status, body = %body, "Chat Completions error");
            return Err(SkeinError::Llm(format!(
                "Chat Completions error: status={} body={}",
                status, body
            )));
        }

        let val: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| SkeinError::Llm(format!("Failed to parse Chat Completions JSON: {e}")))?;

        extract_message_content(&val).ok_or_else(|| {
            SkeinError::Llm("Missing choices[0].message.content in chat completions".into())
        })
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<CompletionChunks> {
        debug!(target: "llm_client", url = %self.chat_url(), "POST streaming chat completion");

        let resp = self
            .request(&self.build_body(&request, true))
            .send()
            .await
            .map_err(|e| SkeinError::Llm(format!("Chat Completions HTTP error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(target: "llm_client", %status, body = %body, "Streaming request rejected");
            return Err(SkeinError::Llm(format!(
                "Chat Completions error: status={} body={}",
                status, body
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(SkeinError::Llm(format!("stream read error: {e}"))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // SSE frames are newline-delimited `data: <json>` lines
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload.is_empty() || payload == "[DONE]" {
                        continue;
                    }
                    if let Some(delta) = extract_stream_delta(payload) {
                        if !delta.is_empty() && tx.send(Ok(delta)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn extract_message_content(v: &serde_json::Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

fn extract_stream_delta(payload: &str) -> Option<String> {
    let v: serde_json::Value = serde_json::from_str(payload).ok()?;
    v.get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}
