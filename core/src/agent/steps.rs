//! Typed agent steps: Planner, Judge, QueryRewriter, Synthesizer.
//!
//! Each step is an explicit request/response pair over the one
//! `LlmClient` seam. Prompt inputs are truncated to per-field token
//! ratios before rendering, with the budget derived from the static
//! template text.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm::{CompletionChunks, CompletionRequest, LlmClient};
use crate::memory::{strip_think, ConversationMemory, ToolMemory};
use crate::tokens::{TokenBudget, Tokenizer};
use crate::tools::{ToolCall, ToolRegistry};
use crate::{Result, SkeinError};

/// Context shared by the judge, rewriter, and synthesizer
pub struct StepInputs<'a> {
    pub current_user_message: &'a str,
    pub conversation: &'a ConversationMemory,
    pub tool_memory: &'a ToolMemory,
}

/// Shared plumbing for one LLM-backed step
pub(crate) struct StepCore {
    llm: Arc<dyn LlmClient>,
    tokenizer: Arc<dyn Tokenizer>,
    budget: TokenBudget,
}

impl StepCore {
    pub(crate) fn new(
        llm: Arc<dyn LlmClient>,
        tokenizer: Arc<dyn Tokenizer>,
        budget: TokenBudget,
    ) -> Self {
        Self {
            llm,
            tokenizer,
            budget,
        }
    }

    fn limits(&self, ratios: &[(&str, f64)], template: &str) -> HashMap<String, i64> {
        self.budget.allocate(ratios, self.tokenizer.count(template))
    }

    fn cut(&self, text: &str, limit: i64) -> String {
        self.tokenizer.truncate(text, limit)
    }

    async fn complete(&self, system: &str, prompt: String) -> Result<String> {
        self.llm
            .complete(CompletionRequest::new(prompt).with_system(system))
            .await
    }
}

// ---------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------

const PLANNER_SYSTEM: &str = "\
Plan the appropriate tool calls to answer the given user question. The \
question may be complex and require multiple hops of tools with \
different kinds of parameters. Respond with JSON only, in the form \
{\"tool_calls\": [{\"name\": \"<tool name>\", \"args\": {...}}]}. Plan an \
empty list when no tool call is needed.";

const PLANNER_RATIOS: &[(&str, f64)] = &[
    ("current_user_message", 2.0 / 15.0),
    ("conversation_history", 3.0 / 15.0),
    ("conversation_summary", 1.0 / 15.0),
    ("tool_history", 5.0 / 15.0),
    ("tool_summary", 1.0 / 15.0),
];

/// The tool calls planned for one iteration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolPlan {
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

pub struct Planner {
    core: StepCore,
}

impl Planner {
    pub(crate) fn new(core: StepCore) -> Self {
        Self { core }
    }

    /// Budgets for the planner's prompt fields. The agent also uses
    /// these to bound both memories, since the planner carries the
    /// largest rendering of each.
    pub fn token_limits(&self) -> HashMap<String, i64> {
        let template = format!(
            "{}\n{}",
            PLANNER_SYSTEM,
            Self::render("", "", "", "", "", "", 0)
        );
        self.core.limits(PLANNER_RATIOS, &template)
    }

    #[allow(clippy::too_many_arguments)]
    fn render(
        query: &str,
        tools: &str,
        previous_plan: &str,
        tool_history: &str,
        tool_summary: &str,
        conversation: &str,
        max_calls: usize,
    ) -> String {
        format!(
            "Current User Message:\n{}\n\n\
             Available Tools:\n{}\n\n\
             Max Calls: {}\n\n\
             Previous Tool Plan:\n{}\n\n\
             Tool History:\n{}\n\n\
             Tool Summary:\n{}\n\n\
             {}\n\n\
             Tool plan (JSON only):",
            query, tools, max_calls, previous_plan, tool_history, tool_summary, conversation
        )
    }

    fn render_conversation(
        limits: &HashMap<String, i64>,
        core: &StepCore,
        inputs: &StepInputs<'_>,
    ) -> String {
        format!(
            "Conversation History:\n{}\n\n\
             Conversation Summary:\n{}",
            core.cut(
                &inputs.conversation.history_str(),
                limits["conversation_history"]
            ),
            core.cut(inputs.conversation.summary(), limits["conversation_summary"]),
        )
    }

    fn tool_menu(tools: &ToolRegistry) -> String {
        tools
            .list_tools()
            .iter()
            .map(|t| {
                format!(
                    "- {}: {}\n  parameters: {}",
                    t.name(),
                    t.description(),
                    t.parameters()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Produce a plan, re-asking up to `retries` extra times when the
    /// output names unknown tools or cannot be parsed. After the last
    /// attempt an invalid-name plan is accepted best-effort (execution
    /// surfaces the unknown tool as a per-call error); an unparsable
    /// response is an error the loop treats as "stop planning".
    pub async fn plan(
        &self,
        inputs: &StepInputs<'_>,
        tools: &ToolRegistry,
        max_calls: usize,
        retries: usize,
    ) -> Result<ToolPlan> {
        let limits = self.token_limits();
        let prompt = Self::render(
            &self
                .core
                .cut(inputs.current_user_message, limits["current_user_message"]),
            &Self::tool_menu(tools),
            &inputs.tool_memory.plan_str(),
            &self
                .core
                .cut(&inputs.tool_memory.history_str(), limits["tool_history"]),
            &self
                .core
                .cut(inputs.tool_memory.summary(), limits["tool_summary"]),
            &Self::render_conversation(&limits, &self.core, inputs),
            max_calls,
        );

        for attempt in 0..=retries {
            let text = self.core.complete(PLANNER_SYSTEM, prompt.clone()).await?;
            match parse_tool_plan(&text) {
                Some(mut plan) => {
                    plan.tool_calls.truncate(max_calls);
                    let unknown: Vec<String> = plan
                        .tool_calls
                        .iter()
                        .filter(|c| !tools.contains(&c.name))
                        .map(|c| c.name.clone())
                        .collect();
                    if unknown.is_empty() {
                        debug!(target: "planner", calls = plan.tool_calls.len(), "Plan accepted");
                        return Ok(plan);
                    }
                    warn!(
                        target: "planner",
                        attempt,
                        unknown = ?unknown,
                        "Planner proposed unknown tools"
                    );
                    if attempt == retries {
                        return Ok(plan);
                    }
                }
                None => {
                    warn!(target: "planner", attempt, "Planner output was not parsable");
                    if attempt == retries {
                        return Err(SkeinError::Llm(
                            "Planner returned no parsable tool plan".to_string(),
                        ));
                    }
                }
            }
        }
        unreachable!("planner retry loop always returns")
    }
}

/// Extract a tool plan from free-form model output: first a
/// `{"tool_calls": [...]}` object, then a bare call array.
fn parse_tool_plan(text: &str) -> Option<ToolPlan> {
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(plan) = serde_json::from_str::<ToolPlan>(&text[start..=end]) {
                return Some(plan);
            }
        }
    }
    if let (Some(start), Some(end)) = (text.find('['), text.rfind(']')) {
        if start < end {
            if let Ok(calls) = serde_json::from_str::<Vec<ToolCall>>(&text[start..=end]) {
                return Some(ToolPlan { tool_calls: calls });
            }
        }
    }
    None
}

// ---------------------------------------------------------------------
// Judge
// ---------------------------------------------------------------------

const JUDGE_SYSTEM: &str = "\
You are capable of making tool calls to retrieve information for \
answering the Current User Message; what you have learned so far is \
given in the Tool History. Judge, based solely on the information given \
below, whether you should respond to the user now or look for more \
information with further tool calls. Respond to the user when either \
(a) the given information is sufficient to answer the Current User \
Message, or (b) the message is so ambiguous that further tool calls \
would not help, in which case you will ask for clarification instead of \
answering. Reply with exactly \"Yes\" to respond to the user now, or \
exactly \"No\" to look for more information.";

const JUDGE_RATIOS: &[(&str, f64)] = &[
    ("current_user_message", 2.0 / 15.0),
    ("conversation_history", 2.0 / 15.0),
    ("conversation_summary", 1.0 / 15.0),
    ("tool_history", 5.0 / 15.0),
    ("tool_summary", 1.0 / 15.0),
];

/// Binary sufficiency judge.
///
/// Sufficiency and hopeless ambiguity are deliberately the same output
/// ("Yes, stop looping"); the synthesizer prompt differentiates
/// answering from asking for clarification. Conflating the two states is
/// inherited behavior, kept as-is.
pub struct Judge {
    core: StepCore,
}

impl Judge {
    pub(crate) fn new(core: StepCore) -> Self {
        Self { core }
    }

    fn render(inputs: &StepInputs<'_>, limits: &HashMap<String, i64>, core: &StepCore) -> String {
        format!(
            "Current User Message:\n{}\n\n\
             Conversation History:\n{}\n\n\
             Conversation Summary:\n{}\n\n\
             Tool History:\n{}\n\n\
             Tool Summary:\n{}\n\n\
             Judgement (Yes or No):",
            core.cut(inputs.current_user_message, limits["current_user_message"]),
            core.cut(
                &inputs.conversation.history_str(),
                limits["conversation_history"]
            ),
            core.cut(inputs.conversation.summary(), limits["conversation_summary"]),
            core.cut(&inputs.tool_memory.history_str(), limits["tool_history"]),
            core.cut(inputs.tool_memory.summary(), limits["tool_summary"]),
        )
    }

    /// Returns `true` when the loop should stop and synthesize. A
    /// malformed verdict is re-asked up to `attempts` total times, then
    /// defaults to `false` (keep looping); an LLM failure also defaults
    /// to `false`. The loop's iteration cap guarantees termination
    /// either way.
    pub async fn assess(&self, inputs: &StepInputs<'_>, attempts: usize) -> bool {
        let template = format!("{}\n{}", JUDGE_SYSTEM, "Judgement (Yes or No):");
        let limits = self.core.limits(JUDGE_RATIOS, &template);
        let prompt = Self::render(inputs, &limits, &self.core);

        for attempt in 0..attempts.max(1) {
            match self.core.complete(JUDGE_SYSTEM, prompt.clone()).await {
                Ok(text) => match parse_verdict(&text) {
                    Some(verdict) => {
                        debug!(target: "judge", verdict, "Judgement");
                        return verdict;
                    }
                    None => {
                        warn!(target: "judge", attempt, raw = %text, "Judgement was not Yes/No");
                    }
                },
                Err(e) => {
                    warn!(target: "judge", error = %e, "Judge call failed; continuing the loop");
                    return false;
                }
            }
        }
        false
    }
}

fn parse_verdict(text: &str) -> Option<bool> {
    let cleaned = strip_think(text).replace('.', "");
    let cleaned = cleaned.trim();
    if cleaned.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if cleaned.eq_ignore_ascii_case("no") {
        Some(false)
    } else {
        None
    }
}

// ---------------------------------------------------------------------
// Query rewriter
// ---------------------------------------------------------------------

const REWRITE_SYSTEM: &str = "\
Rewrite the current user message so that it fixes errors, adds relevant \
context from the conversation and tool history, and closes the gap \
between what is already known and what the question needs. The \
rewritten query will be used with semantic and keyword search tools. Do \
not generate queries for information that has already been retrieved or \
answered. Reply with the rewritten query only.";

const REWRITE_RATIOS: &[(&str, f64)] = &[
    ("current_user_message", 2.0 / 15.0),
    ("conversation_history", 2.0 / 15.0),
    ("conversation_summary", 1.0 / 15.0),
    ("tool_history", 5.0 / 15.0),
    ("tool_summary", 1.0 / 15.0),
];

/// Rewrites the working query between iterations. The original user
/// message is preserved separately for judging and synthesis.
pub struct QueryRewriter {
    core: StepCore,
}

impl QueryRewriter {
    pub(crate) fn new(core: StepCore) -> Self {
        Self { core }
    }

    pub async fn rewrite(&self, inputs: &StepInputs<'_>) -> Result<String> {
        let template = format!("{}\n{}", REWRITE_SYSTEM, "Rewritten query:");
        let limits = self.core.limits(REWRITE_RATIOS, &template);

        let prompt = format!(
            "Current User Message:\n{}\n\n\
             Conversation History:\n{}\n\n\
             Conversation Summary:\n{}\n\n\
             Tool History:\n{}\n\n\
             Tool Summary:\n{}\n\n\
             Rewritten query:",
            self.core
                .cut(inputs.current_user_message, limits["current_user_message"]),
            self.core.cut(
                &inputs.conversation.history_str(),
                limits["conversation_history"]
            ),
            self.core
                .cut(inputs.conversation.summary(), limits["conversation_summary"]),
            self.core
                .cut(&inputs.tool_memory.history_str(), limits["tool_history"]),
            self.core
                .cut(inputs.tool_memory.summary(), limits["tool_summary"]),
        );

        let rewritten = self.core.complete(REWRITE_SYSTEM, prompt).await?;
        Ok(strip_think(&rewritten))
    }
}

// ---------------------------------------------------------------------
// Synthesizer
// ---------------------------------------------------------------------

const SYNTHESIZER_SYSTEM: &str = "\
You are a helpful, respectful, and honest research assistant answering \
the Current User Message from retrieved document context. Follow these \
guidelines strictly:
1. Provide detailed, organized answers, with bullet points or numbered \
lists where appropriate.
2. If the question is ambiguous, first attempt a reasonable answer, then \
politely ask for clarification.
3. When documents informed your answer, end with a reference list: one \
line per source with its name, its URL (say 'No URL' if the source has \
none), and the page number. Never invent, modify, or swap URLs; collapse \
duplicate sources; omit the list entirely when no document was used.
4. Never mention your internal machinery: no references to the \
conversation history, the tool history, or any retriever or tool call.";

const SYNTHESIZER_RATIOS: &[(&str, f64)] = &[
    ("current_user_message", 2.0 / 15.0),
    ("conversation_history", 2.0 / 15.0),
    ("conversation_summary", 1.0 / 15.0),
    ("tool_history", 5.0 / 15.0),
    ("tool_summary", 1.0 / 15.0),
];

/// Produces the final (or intermediate) answer. Runs exactly once per
/// turn in the final position, whether the judge was satisfied, the
/// iteration cap was hit, or planning failed.
pub struct Synthesizer {
    core: StepCore,
}

impl Synthesizer {
    pub(crate) fn new(core: StepCore) -> Self {
        Self { core }
    }

    fn build_request(&self, inputs: &StepInputs<'_>) -> CompletionRequest {
        let template = format!("{}\n{}", SYNTHESIZER_SYSTEM, "Response:");
        let limits = self.core.limits(SYNTHESIZER_RATIOS, &template);

        let prompt = format!(
            "Conversation History:\n{}\n\n\
             Conversation Summary:\n{}\n\n\
             Tool History:\n{}\n\n\
             Tool Summary:\n{}\n\n\
             Current Date: {}\n\n\
             Current User Message:\n{}\n\n\
             Response:",
            self.core.cut(
                &inputs.conversation.history_str(),
                limits["conversation_history"]
            ),
            self.core
                .cut(inputs.conversation.summary(), limits["conversation_summary"]),
            self.core
                .cut(&inputs.tool_memory.history_blocks(), limits["tool_history"]),
            self.core
                .cut(inputs.tool_memory.summary(), limits["tool_summary"]),
            chrono::Utc::now().format("%Y-%m-%d"),
            self.core
                .cut(inputs.current_user_message, limits["current_user_message"]),
        );

        CompletionRequest::new(prompt).with_system(SYNTHESIZER_SYSTEM)
    }

    pub async fn synthesize(&self, inputs: &StepInputs<'_>) -> Result<String> {
        self.core.llm.complete(self.build_request(inputs)).await
    }

    pub async fn synthesize_stream(&self, inputs: &StepInputs<'_>) -> Result<CompletionChunks> {
        self.core
            .llm
            .complete_stream(self.build_request(inputs))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tool_plan_object() {
        let text = r#"Here is my plan: {"tool_calls": [{"name": "document_retriever", "args": {"semantic_query": "advisor"}}]}"#;
        let plan = parse_tool_plan(text).unwrap();
        assert_eq!(plan.tool_calls.len(), 1);
        assert_eq!(plan.tool_calls[0].name, "document_retriever");
        assert_eq!(plan.tool_calls[0].args["semantic_query"], "advisor");
    }

    #[test]
    fn test_parse_tool_plan_bare_array() {
        let text = r#"[{"name": "document_retriever", "args": {}}]"#;
        let plan = parse_tool_plan(text).unwrap();
        assert_eq!(plan.tool_calls.len(), 1);
    }

    #[test]
    fn test_parse_tool_plan_empty_calls() {
        let plan = parse_tool_plan(r#"{"tool_calls": []}"#).unwrap();
        assert!(plan.tool_calls.is_empty());
    }

    #[test]
    fn test_parse_tool_plan_garbage() {
        assert!(parse_tool_plan("I will search for the answer.").is_none());
    }

    #[test]
    fn test_parse_verdict_variants() {
        assert_eq!(parse_verdict("Yes"), Some(true));
        assert_eq!(parse_verdict("No."), Some(false));
        assert_eq!(parse_verdict("<think>hmm</think>Yes."), Some(true));
        assert_eq!(parse_verdict("  no  "), Some(false));
        assert_eq!(parse_verdict("Probably yes"), None);
    }

    #[test]
    fn test_tool_call_args_roundtrip() {
        let call: ToolCall = serde_json::from_value(json!({
            "name": "document_retriever",
            "args": {"semantic_query": "q", "keyword_query": "k"}
        }))
        .unwrap();
        assert_eq!(call.args["keyword_query"], "k");
    }
}
