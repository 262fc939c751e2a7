//! Tool abstraction: trait, registry, and the retrieval tool
//!
//! The agent plans against a fixed menu of tools; each tool executes
//! under a timeout and reports retrieved document ids alongside its
//! result so the loop can maintain its per-turn exclusion set.

mod error;
mod registry;
mod retriever;
mod traits;

pub use error::{ToolError, ToolResult};
pub use registry::ToolRegistry;
pub use retriever::DocumentRetrieverTool;
pub use traits::{Tool, ToolOutcome};

use serde::{Deserialize, Serialize};

/// A planned or executed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}
