use super::error::{ToolError, ToolResult};
use super::traits::{Tool, ToolOutcome};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A registry for managing available tools
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn Tool>>>,
    call_timeout: Duration,
}

impl ToolRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            tools: Arc::new(DashMap::new()),
            call_timeout,
        }
    }

    /// Register a new tool
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        info!(target: "tool_registry", tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    /// Check whether a tool name is known
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.clone())
    }

    /// List all registered tools
    pub fn list_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.iter().map(|t| t.clone()).collect()
    }

    /// Call a tool by name with timeout
    pub async fn call(&self, name: &str, arguments: serde_json::Value) -> ToolResult<ToolOutcome> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        debug!(target: "tool_registry", tool = %name, "Invoking tool");

        let result = match timeout(self.call_timeout, tool.call(arguments)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(target: "tool_registry", tool = %name, "Tool execution timed out");
                Err(ToolError::Timeout)
            }
        };

        if let Err(e) = &result {
            warn!(target: "tool_registry", tool = %name, error = %e, "Tool execution failed");
        }

        result
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
