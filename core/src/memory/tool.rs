//! Tool memory: the per-turn log of tool calls and results.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::conversation::ConversationMemory;
use super::strip_think;
use crate::llm::{CompletionRequest, LlmClient};
use crate::tokens::{fit_suffix_start, TokenBudget, Tokenizer};
use crate::tools::ToolCall;
use crate::Result;

const COMPRESS_SYSTEM_PROMPT: &str = "\
You keep a Tool History of every tool call you made while answering the \
Current User Message. The history has grown too long, so its oldest \
entries are being discarded. You maintain a Summary of everything \
discarded so far. Given the History To Discard and the Previous Summary, \
produce the updated summary. Drop information that is not relevant to the \
Current User Message and keep everything that is. Use Markdown in the \
summary.";

const CURRENT_USER_MESSAGE_RATIO: f64 = 2.0 / 14.0;
const CONVERSATION_HISTORY_RATIO: f64 = 2.0 / 14.0;
const CONVERSATION_SUMMARY_RATIO: f64 = 1.0 / 14.0;
const HISTORY_TO_DISCARD_RATIO: f64 = 5.0 / 14.0;
const PREVIOUS_SUMMARY_RATIO: f64 = 1.0 / 14.0;

/// One executed tool call and its result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub call: ToolCall,
    pub result: serde_json::Value,
}

/// Ordered log of tool calls with a rolling summary and the last plan.
///
/// Reset once per user message; compression only trims, never clears.
pub struct ToolMemory {
    history: Vec<ToolRecord>,
    plan: Vec<ToolCall>,
    summary: String,
    llm: Arc<dyn LlmClient>,
    tokenizer: Arc<dyn Tokenizer>,
    budget: TokenBudget,
}

impl ToolMemory {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tokenizer: Arc<dyn Tokenizer>,
        budget: TokenBudget,
    ) -> Self {
        Self {
            history: Vec::new(),
            plan: Vec::new(),
            summary: String::new(),
            llm,
            tokenizer,
            budget,
        }
    }

    /// Clear history, plan, and summary. Called once per new user message.
    pub fn reset(&mut self) {
        self.history.clear();
        self.plan.clear();
        self.summary.clear();
    }

    /// Remember the most recent tool plan (a planning hint, not a log)
    pub fn set_plan(&mut self, plan: Vec<ToolCall>) {
        self.plan = plan;
    }

    pub fn plan(&self) -> &[ToolCall] {
        &self.plan
    }

    pub fn plan_str(&self) -> String {
        serde_json::to_string(&self.plan).unwrap_or_default()
    }

    /// Record an executed call, then compress the oldest entries if the
    /// serialized history exceeds `max_history_tokens`. The compressor
    /// sees the current user message and conversation context so it can
    /// drop irrelevant information; its output is stripped of any
    /// `<think>` wrapper before being stored.
    pub async fn record(
        &mut self,
        current_user_message: &str,
        conversation: &ConversationMemory,
        call: ToolCall,
        result: serde_json::Value,
        max_history_tokens: i64,
    ) -> Result<()> {
        self.history.push(ToolRecord { call, result });

        let parts = self.serialized_entries()?;
        let start = fit_suffix_start(&parts, "\n", max_history_tokens, &*self.tokenizer);
        if start == 0 {
            return Ok(());
        }

        debug!(
            target: "tool_memory",
            discarded = start,
            kept = self.history.len() - start,
            "Compressing tool history"
        );

        let discard = self.history_range(0, start);
        match self
            .compress(current_user_message, conversation, &discard)
            .await
        {
            Ok(updated) => {
                self.summary = strip_think(&updated);
                self.history.drain(..start);
            }
            Err(e) => {
                warn!(
                    target: "tool_memory",
                    error = %e,
                    "Compression failed; keeping history and summary unchanged"
                );
            }
        }
        Ok(())
    }

    /// Render records `[l, r)` as newline-joined JSON records
    pub fn history_range(&self, l: usize, r: usize) -> String {
        self.history[l..r.min(self.history.len())]
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn history_str(&self) -> String {
        self.history_range(0, self.history.len())
    }

    /// Render the history with record separators for synthesis prompts
    pub fn history_blocks(&self) -> String {
        self.history
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n\n###\n\n")
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    fn serialized_entries(&self) -> Result<Vec<String>> {
        self.history
            .iter()
            .map(|e| serde_json::to_string(e).map_err(Into::into))
            .collect()
    }

    fn render_prompt(
        current_user_message: &str,
        conversation_history: &str,
        conversation_summary: &str,
        history_to_discard: &str,
        previous_summary: &str,
    ) -> String {
        format!(
            "Current User Message:\n{}\n\n\
             Conversation History:\n{}\n\n\
             Conversation Summary:\n{}\n\n\
             History To Discard (JSON lines, oldest first):\n{}\n\n\
             Previous Summary (may be empty):\n{}\n\n\
             Updated Summary:",
            current_user_message,
            conversation_history,
            conversation_summary,
            history_to_discard,
            previous_summary
        )
    }

    fn template_tokens(&self) -> usize {
        let rendered = Self::render_prompt("", "", "", "", "");
        self.tokenizer.count(COMPRESS_SYSTEM_PROMPT) + self.tokenizer.count(&rendered)
    }

    async fn compress(
        &self,
        current_user_message: &str,
        conversation: &ConversationMemory,
        history_to_discard: &str,
    ) -> Result<String> {
        let limits = self.budget.allocate(
            &[
                ("current_user_message", CURRENT_USER_MESSAGE_RATIO),
                ("conversation_history", CONVERSATION_HISTORY_RATIO),
                ("conversation_summary", CONVERSATION_SUMMARY_RATIO),
                ("history_to_discard", HISTORY_TO_DISCARD_RATIO),
                ("previous_summary", PREVIOUS_SUMMARY_RATIO),
            ],
            self.template_tokens(),
        );

        let tok = &*self.tokenizer;
        let prompt = Self::render_prompt(
            &tok.truncate(current_user_message, limits["current_user_message"]),
            &tok.truncate(&conversation.history_str(), limits["conversation_history"]),
            &tok.truncate(conversation.summary(), limits["conversation_summary"]),
            &tok.truncate(history_to_discard, limits["history_to_discard"]),
            &tok.truncate(&self.summary, limits["previous_summary"]),
        );

        let request = CompletionRequest::new(prompt).with_system(COMPRESS_SYSTEM_PROMPT);
        self.llm.complete(request).await
    }
}
