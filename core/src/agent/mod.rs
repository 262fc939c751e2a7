//! The agent control loop.
//!
//! One user message runs as one turn: plan tool calls, execute them,
//! judge sufficiency, optionally rewrite the working query, repeat up to
//! the iteration cap, then synthesize exactly once. Conversation and
//! tool memories persist across iterations (and, for the conversation,
//! across turns) under their token budgets.

mod steps;
mod stream;

pub use steps::{Judge, Planner, QueryRewriter, StepInputs, Synthesizer, ToolPlan};
pub use stream::ResponseStream;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::llm::LlmClient;
use crate::memory::{ConversationMemory, Role, ToolMemory};
use crate::retrieval::{
    HybridRetriever, HybridRetrieverConfig, KeywordIndex, RerankClient, Reranker, SearchScope,
    VectorIndex,
};
use crate::tokens::{TokenBudget, Tokenizer};
use crate::tools::{DocumentRetrieverTool, ToolRegistry};
use crate::Result;

/// External collaborators injected at construction
pub struct AgentBackends {
    pub llm: Arc<dyn LlmClient>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub vector: Arc<dyn VectorIndex>,
    pub keyword: Arc<dyn KeywordIndex>,
    /// Reranking endpoint; `None` disables the rerank pass
    pub rerank: Option<Arc<dyn RerankClient>>,
}

/// One incoming user message
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub message: String,
    /// Owner of the private corpus for modes 1 and 2
    pub user_id: String,
    /// 0 = shared corpus, 1 = the user's files, 2 = both
    pub search_mode: u8,
    /// File names scoping modes 1 and 2
    pub files: Vec<String>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user_id: String::new(),
            search_mode: 0,
            files: Vec::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_search_mode(mut self, mode: u8, files: Vec<String>) -> Self {
        self.search_mode = mode;
        self.files = files;
        self
    }
}

/// The synthesized answer for a turn
#[derive(Debug)]
pub enum TurnOutput {
    Answer(String),
    Stream(ResponseStream),
}

/// The previous turn's answer, committed to conversation memory only
/// when the next user message arrives (a streamed answer may still be in
/// flight when the turn nominally ends).
enum PrevResponse {
    None,
    Text(String),
    Streamed(Arc<Mutex<String>>),
}

impl PrevResponse {
    fn take(&mut self) -> Option<String> {
        match std::mem::replace(self, PrevResponse::None) {
            PrevResponse::None => None,
            PrevResponse::Text(text) => Some(text),
            PrevResponse::Streamed(buffer) => Some(buffer.lock().unwrap().clone()),
        }
    }
}

/// Retrieval-augmented chat agent for one session.
///
/// An instance owns its memories and must not serve concurrent turns;
/// `turn` takes `&mut self`, so at most one turn is in flight per
/// instance. Concurrent sessions use separate instances, or the caller
/// serializes externally (e.g. a per-session lock).
pub struct Agent {
    config: AgentConfig,
    backends: AgentBackends,
    planner: Planner,
    judge: Judge,
    rewriter: QueryRewriter,
    synthesizer: Synthesizer,
    conversation: ConversationMemory,
    tool_memory: ToolMemory,
    /// Ids of documents already surfaced this turn; invisible to prompts
    seen: Arc<Mutex<HashSet<String>>>,
    prev_response: PrevResponse,
    intermediate_tx: Option<mpsc::Sender<String>>,
}

impl Agent {
    pub fn new(config: AgentConfig, backends: AgentBackends) -> Self {
        let budget =
            TokenBudget::new(config.context_window).with_reserved(config.reserved_tokens);
        let core = || {
            steps::StepCore::new(
                backends.llm.clone(),
                backends.tokenizer.clone(),
                budget.clone(),
            )
        };

        let conversation = ConversationMemory::new(
            backends.llm.clone(),
            backends.tokenizer.clone(),
            budget.clone(),
        );
        let tool_memory = ToolMemory::new(
            backends.llm.clone(),
            backends.tokenizer.clone(),
            budget.clone(),
        );

        Self {
            planner: Planner::new(core()),
            judge: Judge::new(core()),
            rewriter: QueryRewriter::new(core()),
            synthesizer: Synthesizer::new(core()),
            conversation,
            tool_memory,
            seen: Arc::new(Mutex::new(HashSet::new())),
            prev_response: PrevResponse::None,
            intermediate_tx: None,
            config,
            backends,
        }
    }

    /// Seed conversation memory from a persisted transcript of
    /// `(role, content)` entries; adjacent user → assistant pairs are
    /// registered, anything else is skipped.
    pub fn seed_conversation(&mut self, transcript: &[(String, String)]) {
        for pair in transcript.windows(2) {
            let (first_role, first) = &pair[0];
            let (second_role, second) = &pair[1];
            if first_role.eq_ignore_ascii_case("user")
                && (second_role.eq_ignore_ascii_case("assistant")
                    || second_role.eq_ignore_ascii_case("bot"))
            {
                self.conversation.register(Role::User, first.clone());
                self.conversation.register(Role::Assistant, second.clone());
            }
        }
    }

    /// Discard conversation memory and the pending previous response,
    /// keeping the agent itself.
    pub fn reset(&mut self) {
        self.prev_response = PrevResponse::None;
        self.conversation = ConversationMemory::new(
            self.backends.llm.clone(),
            self.backends.tokenizer.clone(),
            TokenBudget::new(self.config.context_window)
                .with_reserved(self.config.reserved_tokens),
        );
    }

    /// Receive each non-final iteration's synthesized answer as the turn
    /// progresses. Replaces any previously installed channel.
    pub fn intermediate_channel(&mut self, buffer: usize) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.intermediate_tx = Some(tx);
        rx
    }

    pub fn conversation(&self) -> &ConversationMemory {
        &self.conversation
    }

    /// Run one turn: at most `max_iterations` rounds of tool calling,
    /// then exactly one synthesis.
    pub async fn turn(&mut self, request: TurnRequest) -> Result<TurnOutput> {
        // Fast local validation before any backend call
        let scope =
            SearchScope::from_mode(request.search_mode, &request.user_id, &request.files)?;

        info!(
            target: "agent",
            search_mode = request.search_mode,
            max_iterations = self.config.max_iterations,
            "Turn started"
        );

        // Budgets for both memories, derived from the planner template
        // (the planner carries the largest rendering of each memory)
        let limits = self.planner.token_limits();
        let conversation_budget = limits["conversation_history"];
        let tool_budget = limits["tool_history"];

        // Per-turn state: tool memory and the seen-id set reset once per
        // user message, never mid-turn
        self.tool_memory.reset();
        self.seen.lock().unwrap().clear();

        // Commit the previous turn's answer now that the next message
        // has arrived
        if let Some(previous) = self.prev_response.take() {
            self.conversation
                .append(Role::Assistant, previous, conversation_budget)
                .await?;
        }

        let registry = self.build_registry(scope);

        let mut query = request.message.clone();
        let last_iteration = self.config.max_iterations.saturating_sub(1);

        for iteration in 0..self.config.max_iterations {
            debug!(target: "agent", iteration, "Planning");

            let inputs = StepInputs {
                current_user_message: &query,
                conversation: &self.conversation,
                tool_memory: &self.tool_memory,
            };
            let plan = match self
                .planner
                .plan(
                    &inputs,
                    &registry,
                    self.config.max_tool_calls,
                    self.config.planner_retries,
                )
                .await
            {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(target: "agent", error = %e, "Planning failed; synthesizing with what we have");
                    break;
                }
            };
            self.tool_memory.set_plan(plan.tool_calls.clone());

            for call in plan.tool_calls {
                debug!(target: "agent", tool = %call.name, "Executing tool");
                let result = match registry.call(&call.name, call.args.clone()).await {
                    Ok(outcome) => {
                        self.seen
                            .lock()
                            .unwrap()
                            .extend(outcome.seen_ids.into_iter());
                        outcome.result
                    }
                    // One failed call must not block the others; the
                    // error text becomes the call's recorded result
                    Err(e) => serde_json::Value::String(e.to_string()),
                };
                self.tool_memory
                    .record(
                        &request.message,
                        &self.conversation,
                        call,
                        result,
                        tool_budget,
                    )
                    .await?;
            }

            // The final round always proceeds to synthesis
            if iteration == last_iteration {
                break;
            }

            let inputs = StepInputs {
                current_user_message: &request.message,
                conversation: &self.conversation,
                tool_memory: &self.tool_memory,
            };
            if self.judge.assess(&inputs, self.config.judge_retries).await {
                debug!(target: "agent", iteration, "Judged sufficient");
                break;
            }

            if self.config.rewrite_query {
                let inputs = StepInputs {
                    current_user_message: &query,
                    conversation: &self.conversation,
                    tool_memory: &self.tool_memory,
                };
                match self.rewriter.rewrite(&inputs).await {
                    Ok(rewritten) if !rewritten.is_empty() => {
                        debug!(target: "agent", query = %rewritten, "Query rewritten");
                        query = rewritten;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(target: "agent", error = %e, "Query rewrite failed"),
                }
            }

            if let Some(tx) = &self.intermediate_tx {
                let inputs = StepInputs {
                    current_user_message: &request.message,
                    conversation: &self.conversation,
                    tool_memory: &self.tool_memory,
                };
                if let Ok(partial) = self.synthesizer.synthesize(&inputs).await {
                    let _ = tx.send(partial).await;
                }
            }
        }

        // Exactly one final synthesis per turn
        let inputs = StepInputs {
            current_user_message: &request.message,
            conversation: &self.conversation,
            tool_memory: &self.tool_memory,
        };
        let output = if self.config.streaming {
            let chunks = self.synthesizer.synthesize_stream(&inputs).await?;
            let (stream, collected) = ResponseStream::spawn(chunks);
            self.prev_response = PrevResponse::Streamed(collected);
            TurnOutput::Stream(stream)
        } else {
            let answer = self.synthesizer.synthesize(&inputs).await?;
            self.prev_response = PrevResponse::Text(answer.clone());
            TurnOutput::Answer(answer)
        };

        self.conversation
            .append(Role::User, request.message, conversation_budget)
            .await?;

        info!(target: "agent", "Turn complete");
        Ok(output)
    }

    fn build_registry(&self, scope: SearchScope) -> ToolRegistry {
        let retrieval = &self.config.retrieval;
        let reranker = self.backends.rerank.as_ref().map(|client| {
            Arc::new(Reranker::new(
                client.clone(),
                retrieval.reranker_top_n,
                retrieval.reranker_backup_top_n,
            ))
        });

        let retriever = Arc::new(HybridRetriever::new(
            self.backends.vector.clone(),
            self.backends.keyword.clone(),
            reranker,
            scope,
            HybridRetrieverConfig {
                top_k: retrieval.top_k,
                branch_timeout: retrieval.branch_timeout(),
                shared_owner: retrieval.shared_corpus.clone(),
            },
        ));

        let registry = ToolRegistry::new(retrieval.tool_timeout());
        registry.register(Arc::new(DocumentRetrieverTool::new(
            retriever,
            self.seen.clone(),
        )));
        registry
    }
}
