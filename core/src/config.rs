//! Agent configuration
//!
//! Plain structs constructed once at startup and injected into the
//! components that need them; defaults come from the environment.

use std::time::Duration;

/// Knobs for the retrieval pipeline
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Candidates requested from each search branch
    pub top_k: usize,
    /// Survivors of a successful rerank pass
    pub reranker_top_n: usize,
    /// Survivors of the rerank fallback (original-score ordering)
    pub reranker_backup_top_n: usize,
    /// Per-branch search timeout in milliseconds
    pub branch_timeout_ms: u64,
    /// Timeout for a whole tool call in milliseconds
    pub tool_timeout_ms: u64,
    /// Owner tag of the shared corpus
    pub shared_corpus: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: env_usize("RETRIEVER_TOP_K", 25),
            reranker_top_n: env_usize("RERANKER_TOP_N", 5),
            reranker_backup_top_n: env_usize("RERANKER_BACKUP_TOP_N", 10),
            branch_timeout_ms: env_u64("RETRIEVER_BRANCH_TIMEOUT_MS", 5_000),
            tool_timeout_ms: env_u64("TOOL_TIMEOUT_MS", 30_000),
            shared_corpus: std::env::var("SHARED_CORPUS_OWNER")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "shared".to_string()),
        }
    }
}

impl RetrievalConfig {
    pub fn branch_timeout(&self) -> Duration {
        Duration::from_millis(self.branch_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

/// Top-level agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model context window, in tokens; the base of all budget math
    pub context_window: usize,
    /// Tokens held back for special tokens when allocating budgets
    pub reserved_tokens: usize,
    /// Maximum rounds of tool calling per user message (includes the
    /// first round)
    pub max_iterations: usize,
    /// Stream the synthesized answer instead of returning one string
    pub streaming: bool,
    /// Rewrite the working query between iterations
    pub rewrite_query: bool,
    /// Tool calls executed per iteration, at most
    pub max_tool_calls: usize,
    /// Re-attempts when the planner emits an invalid plan
    pub planner_retries: usize,
    /// Total attempts to get a well-formed judge verdict
    pub judge_retries: usize,
    pub retrieval: RetrievalConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            context_window: env_usize("LLM_CONTEXT_WINDOW", 32_000),
            reserved_tokens: 100,
            max_iterations: env_usize("AGENT_MAX_ITERATIONS", 5),
            streaming: false,
            rewrite_query: true,
            max_tool_calls: 2,
            planner_retries: 3,
            judge_retries: 2,
            retrieval: RetrievalConfig::default(),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}
