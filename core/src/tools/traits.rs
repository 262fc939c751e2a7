use super::error::ToolResult;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;

/// What a tool call produced.
#[derive(Debug)]
pub struct ToolOutcome {
    /// Result payload, serialized for the tool history
    pub result: Value,
    /// Document ids surfaced by this call, for the turn's exclusion set
    pub seen_ids: HashSet<String>,
}

impl ToolOutcome {
    pub fn from_value(result: Value) -> Self {
        Self {
            result,
            seen_ids: HashSet::new(),
        }
    }
}

/// The core trait for all tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of the tool (e.g., "document_retriever")
    fn name(&self) -> String;

    /// A human-readable description of what the tool does
    fn description(&self) -> String;

    /// The JSON Schema for the tool's arguments
    fn parameters(&self) -> Value;

    /// Execute the tool with the given arguments
    async fn call(&self, arguments: Value) -> ToolResult<ToolOutcome>;
}
