//! Exposes remote MCP tools as [`ToolExecutor`]s
//!
//! An adapter pairs one tool descriptor with the client of the server that
//! advertised it. Names are namespaced as `{prefix}_{tool}` and sanitized so
//! that any function-calling provider accepts them.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::mcp::protocol::McpClient;
use crate::mcp::types::{CallToolResponse, McpTool, ResourceContents, ToolResponseContent};
use crate::tools::{ToolExecutor, ToolResult, DEFAULT_MAX_OUTPUT_BYTES};

/// Longest name providers accept for a function.
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Build the agent-facing name for `tool` under `prefix`.
///
/// # Examples
///
/// ```
/// use mcpbridge::mcp::tool_adapter::adapter_tool_name;
///
/// assert_eq!(adapter_tool_name(Some("fs"), "read.file"), "fs_read_file");
/// assert_eq!(adapter_tool_name(None, "echo"), "echo");
/// ```
pub fn adapter_tool_name(prefix: Option<&str>, tool: &str) -> String {
    let raw = match prefix {
        Some(p) if !p.is_empty() => format!("{}_{}", p, tool),
        _ => tool.to_string(),
    };
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TOOL_NAME_LEN)
        .collect()
}

/// Concatenate the content blocks of a call result into text.
///
/// Text blocks are kept as-is, images render as `[image: mime]`, text
/// resources contribute their text and blob resources `[resource: uri]`.
pub fn render_content(response: &CallToolResponse) -> String {
    response
        .content
        .iter()
        .filter_map(|block| match block {
            ToolResponseContent::Text { text } => Some(text.clone()),
            ToolResponseContent::Image { mime_type, .. } => Some(format!("[image: {}]", mime_type)),
            ToolResponseContent::Resource { resource } => Some(match resource {
                ResourceContents::Text(t) => t.text.clone(),
                ResourceContents::Blob(b) => format!("[resource: {}]", b.uri),
            }),
            ToolResponseContent::Unsupported => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// One remote tool behind the [`ToolExecutor`] interface.
#[derive(Debug, Clone)]
pub struct McpToolAdapter {
    client: Arc<McpClient>,
    server: String,
    tool: McpTool,
    name: String,
    max_output_bytes: usize,
}

impl McpToolAdapter {
    /// Wrap `tool` from `server`.
    pub fn new(
        client: Arc<McpClient>,
        server: impl Into<String>,
        prefix: Option<&str>,
        tool: McpTool,
    ) -> Self {
        let name = adapter_tool_name(prefix, &tool.name);
        Self {
            client,
            server: server.into(),
            tool,
            name,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Cap on rendered output.
    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Server this tool belongs to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The tool's own (unprefixed) name.
    pub fn remote_name(&self) -> &str {
        &self.tool.name
    }

    /// The descriptor this adapter was built from.
    pub fn descriptor(&self) -> &McpTool {
        &self.tool
    }

    fn description(&self) -> String {
        self.tool
            .description
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| format!("MCP tool {} from {}", self.tool.name, self.server))
    }

    fn invalid(&self, detail: impl std::fmt::Display) -> anyhow::Error {
        BridgeError::Tool(format!("{}: {}", self.name, detail)).into()
    }
}

/// Whether `value` matches the JSON Schema primitive `type_name`.
///
/// Unknown type names are accepted.
fn matches_type(type_name: &str, value: &Value) -> bool {
    match type_name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[async_trait]
impl ToolExecutor for McpToolAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn tool_definition(&self) -> Value {
        let parameters = serde_json::to_value(&self.tool.input_schema)
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
        serde_json::json!({
            "name": self.name,
            "description": self.description(),
            "parameters": parameters,
        })
    }

    fn validate(&self, args: &Value) -> Result<()> {
        let empty = serde_json::Map::new();
        let object = match args {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(self.invalid(format!(
                    "arguments must be a JSON object, got {}",
                    other
                )))
            }
        };

        let schema = &self.tool.input_schema;
        for field in &schema.required {
            if !object.contains_key(field) {
                return Err(self.invalid(format!("missing required argument `{}`", field)));
            }
        }

        for (key, value) in object {
            let Some(declared) = schema
                .properties
                .get(key)
                .and_then(|p| p.schema_type.as_ref())
            else {
                continue;
            };
            let names = declared.names();
            if !names.iter().any(|t| matches_type(t, value)) {
                return Err(self.invalid(format!(
                    "argument `{}` must be of type {}",
                    key,
                    names.join(" | ")
                )));
            }
        }

        Ok(())
    }

    async fn execute(&self, ct: &CancellationToken, args: Value) -> Result<ToolResult> {
        self.validate(&args)?;
        let arguments = match args {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };

        tracing::debug!(server = %self.server, tool = %self.tool.name, "calling MCP tool");
        let result = match self
            .client
            .call_tool(ct, &self.tool.name, Some(arguments))
            .await
        {
            Ok(response) => {
                self.client.record_success();
                let text = render_content(&response);
                if response.is_error() {
                    ToolResult::error(text)
                } else {
                    ToolResult::success(text).truncate_if_needed(self.max_output_bytes)
                }
            }
            Err(e) => {
                match self.client.record_call_error(&e) {
                    Some(failures) => tracing::warn!(
                        server = %self.server,
                        tool = %self.tool.name,
                        consecutive_failures = failures,
                        error = %e,
                        "MCP tool call failed"
                    ),
                    None => tracing::debug!(
                        server = %self.server,
                        tool = %self.tool.name,
                        "MCP tool call cancelled"
                    ),
                }
                ToolResult::error(format!("{:#}", e))
            }
        };

        Ok(result
            .with_metadata("server", self.server.clone())
            .with_metadata("tool", self.tool.name.clone()))
    }
}
