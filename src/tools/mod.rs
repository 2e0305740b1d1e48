//! Tool abstraction for mcpbridge
//!
//! This module contains the executor trait an agent drives, the registry
//! that holds executors by name, and the result type they return. MCP
//! tools plug in through [`crate::mcp::tool_adapter::McpToolAdapter`].

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default cap on tool output handed back to an agent, in bytes.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Tool result structure
///
/// Represents the result of a tool execution with metadata
/// and truncation support.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// Whether the tool execution succeeded
    pub success: bool,
    /// Output from the tool
    pub output: String,
    /// Error message if execution failed
    pub error: Option<String>,
    /// Whether the output was truncated
    pub truncated: bool,
    /// Additional metadata about the execution
    pub metadata: HashMap<String, String>,
}

impl ToolResult {
    /// Create a successful tool result
    pub fn success(output: String) -> Self {
        Self {
            success: true,
            output,
            error: None,
            truncated: false,
            metadata: HashMap::new(),
        }
    }

    /// Create a failed tool result
    pub fn error(error: String) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
            truncated: false,
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the result
    ///
    /// # Arguments
    ///
    /// * `key` - Metadata key
    /// * `value` - Metadata value
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Truncate output if it exceeds the maximum size
    ///
    /// The cut lands on a character boundary at or below `max_size` bytes.
    pub fn truncate_if_needed(mut self, max_size: usize) -> Self {
        if self.output.len() > max_size {
            let mut cut = max_size;
            while !self.output.is_char_boundary(cut) {
                cut -= 1;
            }
            self.output.truncate(cut);
            self.output.push_str("\n... (truncated)");
            self.truncated = true;
        }
        self
    }

    /// Convert to a message string for the conversation
    pub fn to_message(&self) -> String {
        if self.success {
            if self.truncated {
                format!("{}\n(Output truncated to fit context window)", self.output)
            } else {
                self.output.clone()
            }
        } else {
            format!(
                "Error: {}",
                self.error.as_deref().unwrap_or("Unknown error")
            )
        }
    }
}

/// Tool executor trait for implementing tool execution logic
///
/// # Examples
///
/// ```no_run
/// use mcpbridge::tools::{ToolExecutor, ToolResult};
/// use mcpbridge::error::Result;
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use tokio_util::sync::CancellationToken;
///
/// struct MyTool;
///
/// #[async_trait]
/// impl ToolExecutor for MyTool {
///     fn name(&self) -> &str {
///         "my_tool"
///     }
///
///     fn tool_definition(&self) -> Value {
///         serde_json::json!({
///             "name": "my_tool",
///             "description": "Does something useful",
///             "parameters": {"type": "object", "properties": {}}
///         })
///     }
///
///     async fn execute(&self, _ct: &CancellationToken, _args: Value) -> Result<ToolResult> {
///         Ok(ToolResult::success("Success".to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Name the agent uses to call this tool
    fn name(&self) -> &str;

    /// Returns the tool definition as a JSON value
    ///
    /// The definition follows the function-calling shape:
    /// ```json
    /// {
    ///   "name": "tool_name",
    ///   "description": "Tool description",
    ///   "parameters": {
    ///     "type": "object",
    ///     "properties": {
    ///       "param1": {"type": "string", "description": "..."}
    ///     },
    ///     "required": ["param1"]
    ///   }
    /// }
    /// ```
    fn tool_definition(&self) -> serde_json::Value;

    /// Check arguments before execution
    ///
    /// The default accepts anything.
    fn validate(&self, _args: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Executes the tool with the given arguments
    ///
    /// # Errors
    ///
    /// Returns error only for failures outside the tool itself; a tool that
    /// ran and failed reports it through [`ToolResult::error`].
    async fn execute(&self, ct: &CancellationToken, args: serde_json::Value)
        -> Result<ToolResult>;
}

/// Tool registry for managing available tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl ToolRegistry {
    /// Create a new empty tool registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool executor under its own name
    ///
    /// Returns the executor previously registered under that name, if any.
    pub fn register(&mut self, executor: Arc<dyn ToolExecutor>) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.insert(executor.name().to_string(), executor)
    }

    /// Remove a tool by name
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.remove(name)
    }

    /// Get a tool executor by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get all tool definitions as JSON values
    pub fn all_definitions(&self) -> Vec<serde_json::Value> {
        self.tools
            .values()
            .map(|executor| executor.tool_definition())
            .collect()
    }

    /// Get the number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
