//! Conversation memory: the user/assistant turn log.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm::{CompletionRequest, LlmClient};
use crate::tokens::{fit_suffix_start, TokenBudget, Tokenizer};
use crate::Result;

const COMPRESS_SYSTEM_PROMPT: &str = "\
You keep a Conversation History of everything said between the user and \
you, the assistant. The history has grown too long, so its oldest entries \
are being discarded. You maintain a Summary of everything discarded so \
far. Given the History To Discard and the Previous Summary, produce the \
updated summary. Use Markdown in the summary.";

const HISTORY_TO_DISCARD_RATIO: f64 = 2.0 / 4.0;
const PREVIOUS_SUMMARY_RATIO: f64 = 1.0 / 4.0;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One immutable turn of the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
}

/// Ordered log of conversation turns with a rolling summary.
///
/// Entries older than the compression boundary are destroyed and folded
/// into `summary`; the remaining serialized history fits the budget
/// passed to `append`.
pub struct ConversationMemory {
    history: Vec<ConversationEntry>,
    summary: String,
    llm: Arc<dyn LlmClient>,
    tokenizer: Arc<dyn Tokenizer>,
    budget: TokenBudget,
}

impl ConversationMemory {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tokenizer: Arc<dyn Tokenizer>,
        budget: TokenBudget,
    ) -> Self {
        Self {
            history: Vec::new(),
            summary: String::new(),
            llm,
            tokenizer,
            budget,
        }
    }

    /// Append without compression. Used to seed prior conversation.
    pub fn register(&mut self, role: Role, content: impl Into<String>) {
        self.history.push(ConversationEntry {
            role,
            content: content.into(),
        });
    }

    /// Append a turn, then compress the oldest entries if the serialized
    /// history exceeds `max_history_tokens`. Compression fully resolves
    /// before this returns; a compressor failure leaves history and
    /// summary untouched (logged, retried on the next append).
    pub async fn append(
        &mut self,
        role: Role,
        content: impl Into<String>,
        max_history_tokens: i64,
    ) -> Result<()> {
        self.register(role, content);

        let parts = self.serialized_entries()?;
        let start = fit_suffix_start(&parts, "\n", max_history_tokens, &*self.tokenizer);
        if start == 0 {
            return Ok(());
        }

        debug!(
            target: "conversation_memory",
            discarded = start,
            kept = self.history.len() - start,
            "Compressing conversation history"
        );

        let discard = self.history_range(0, start);
        match self.compress(&discard).await {
            Ok(updated) => {
                self.summary = updated;
                self.history.drain(..start);
            }
            Err(e) => {
                warn!(
                    target: "conversation_memory",
                    error = %e,
                    "Compression failed; keeping history and summary unchanged"
                );
            }
        }
        Ok(())
    }

    /// Render entries `[l, r)` as newline-joined JSON records
    pub fn history_range(&self, l: usize, r: usize) -> String {
        self.history[l..r.min(self.history.len())]
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Render the full history
    pub fn history_str(&self) -> String {
        self.history_range(0, self.history.len())
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

    fn render_prompt(history_to_discard: &str, previous_summary: &str) -> String {
        format!(
            "History To Discard (JSON lines, oldest first):\n{}\n\n\
             Previous Summary (may be empty):\n{}\n\n\
             Updated Summary:",
            history_to_discard, previous_summary
        )
    }

    fn template_tokens(&self) -> usize {
        let rendered = Self::render_prompt("", "");
        self.tokenizer.count(COMPRESS_SYSTEM_PROMPT) + self.tokenizer.count(&rendered)
    }

    async fn compress(&self, history_to_discard: &str) -> Result<String> {
        let limits = self.budget.allocate(
            &[
                ("history_to_discard", HISTORY_TO_DISCARD_RATIO),
                ("previous_summary", PREVIOUS_SUMMARY_RATIO),
            ],
            self.template_tokens(),
        );

        let discard = self
            .tokenizer
            .truncate(history_to_discard, limits["history_to_discard"]);
        let previous = self
            .tokenizer
            .truncate(&self.summary, limits["previous_summary"]);

        let request = CompletionRequest::new(Self::render_prompt(&discard, &previous))
            .with_system(COMPRESS_SYSTEM_PROMPT);
        self.llm.complete(request).await
    }
}
