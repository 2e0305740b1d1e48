//! MCP server configuration types
//!
//! This module defines the `mcp:` block of the configuration file: global
//! timeouts and the list of servers the manager may connect to.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// How a server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawn a child process and speak newline-delimited JSON over its pipes.
    #[default]
    Stdio,
    /// POST JSON-RPC to a Streamable HTTP endpoint.
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => f.write_str("stdio"),
            TransportKind::Http => f.write_str("http"),
        }
    }
}

/// One configured MCP server.
///
/// Immutable after load; owned by the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// Unique name; also the default tool prefix
    pub name: String,

    /// Transport kind
    #[serde(default)]
    pub transport: TransportKind,

    /// Executable for stdio servers
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments for stdio servers
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides for stdio servers; values may reference
    /// `$VAR` / `${VAR}` from the parent environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for stdio servers
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Endpoint for http servers
    #[serde(default)]
    pub url: Option<String>,

    /// Extra HTTP headers sent on every request
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Connect during `connect_all`
    #[serde(default = "default_auto_connect")]
    pub auto_connect: bool,

    /// Per-request timeout; falls back to the global value
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Reconnect ceiling; falls back to the global value
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Minimum delay between reconnect attempts
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,

    /// Prefix for adapter tool names; `None` uses the server name
    #[serde(default)]
    pub tool_prefix: Option<String>,
}

fn default_auto_connect() -> bool {
    true
}

fn default_retry_delay_seconds() -> u64 {
    2
}

impl McpServerConfig {
    /// A stdio server running `command`.
    ///
    /// # Examples
    ///
    /// ```
    /// use mcpbridge::mcp::config::{McpServerConfig, TransportKind};
    ///
    /// let cfg = McpServerConfig::stdio("fs", "mcp-fs").with_args(["/tmp"]);
    /// assert_eq!(cfg.transport, TransportKind::Stdio);
    /// assert_eq!(cfg.args, vec!["/tmp".to_string()]);
    /// ```
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: Some(command.into()),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            url: None,
            headers: HashMap::new(),
            auto_connect: default_auto_connect(),
            timeout_seconds: None,
            max_retries: None,
            retry_delay_seconds: default_retry_delay_seconds(),
            tool_prefix: None,
        }
    }

    /// An http server at `url`.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            command: None,
            url: Some(url.into()),
            ..Self::stdio(name, "")
        }
    }

    /// Replace the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add one environment override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the tool prefix.
    pub fn with_tool_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tool_prefix = Some(prefix.into());
        self
    }

    /// Set `auto_connect`.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Set the reconnect ceiling.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the delay between reconnect attempts.
    pub fn with_retry_delay_seconds(mut self, seconds: u64) -> Self {
        self.retry_delay_seconds = seconds;
        self
    }

    /// Prefix used when naming adapter tools.
    pub fn effective_tool_prefix(&self) -> &str {
        self.tool_prefix.as_deref().unwrap_or(&self.name)
    }

    /// Minimum delay between reconnect attempts.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }

    /// Check this entry in isolation.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] naming the offending server.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BridgeError::Config("MCP server name cannot be empty".to_string()).into());
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(BridgeError::Config(format!(
                "MCP server name `{}` may only contain letters, digits, `_` and `-`",
                self.name
            ))
            .into());
        }

        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().map_or(true, str::is_empty) {
                    return Err(BridgeError::Config(format!(
                        "MCP server `{}`: stdio transport requires a command",
                        self.name
                    ))
                    .into());
                }
            }
            TransportKind::Http => {
                let raw = self.url.as_deref().unwrap_or_default();
                let parsed = url::Url::parse(raw).map_err(|e| {
                    BridgeError::Config(format!(
                        "MCP server `{}`: invalid url `{}`: {}",
                        self.name, raw, e
                    ))
                })?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(BridgeError::Config(format!(
                        "MCP server `{}`: url must use http or https, got `{}`",
                        self.name,
                        parsed.scheme()
                    ))
                    .into());
                }
            }
        }

        if self.timeout_seconds == Some(0) {
            return Err(BridgeError::Config(format!(
                "MCP server `{}`: timeout_seconds must be greater than 0",
                self.name
            ))
            .into());
        }

        Ok(())
    }
}

/// The `mcp:` configuration block.
///
/// Defaults to no servers so that files which omit the key still
/// deserialize.
///
/// # Examples
///
/// ```
/// use mcpbridge::mcp::config::McpConfig;
///
/// let cfg = McpConfig::default();
/// assert!(cfg.servers.is_empty());
/// assert_eq!(cfg.max_reconnect_attempts, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    /// Default per-request timeout
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Bound on connect + handshake + first tool listing
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,

    /// Health monitor period
    #[serde(default = "default_health_check_interval_seconds")]
    pub health_check_interval_seconds: u64,

    /// Default reconnect ceiling
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Configured servers
    #[serde(default)]
    pub servers: Vec<McpServerConfig>,
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_connect_timeout_seconds() -> u64 {
    30
}

fn default_health_check_interval_seconds() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            request_timeout_seconds: default_request_timeout_seconds(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            health_check_interval_seconds: default_health_check_interval_seconds(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            servers: Vec::new(),
        }
    }
}

impl McpConfig {
    /// Look up a server by name.
    pub fn server(&self, name: &str) -> Option<&McpServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Default per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Connect bound.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Health monitor period.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    /// Validate global values and every server entry.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] on the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_seconds == 0 {
            return Err(BridgeError::Config(
                "mcp.request_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.connect_timeout_seconds == 0 {
            return Err(BridgeError::Config(
                "mcp.connect_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.health_check_interval_seconds == 0 {
            return Err(BridgeError::Config(
                "mcp.health_check_interval_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(BridgeError::Config(format!(
                    "duplicate MCP server name `{}`",
                    server.name
                ))
                .into());
            }
        }

        Ok(())
    }
}
