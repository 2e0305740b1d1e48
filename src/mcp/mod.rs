//! MCP (Model Context Protocol) client support for mcpbridge
//!
//! This module connects to external MCP servers over stdio or HTTP, keeps
//! them healthy, and exposes their tools through the generic
//! [`crate::tools::ToolExecutor`] interface.
//!
//! The implementation targets protocol revision **2025-11-25** and accepts
//! the earlier revisions listed in [`types::SUPPORTED_PROTOCOL_VERSIONS`].
//!
//! # Module Layout
//!
//! - `types`        -- JSON-RPC envelope and MCP payload types
//! - `transport`    -- `Transport` trait with stdio and HTTP implementations
//! - `client`       -- request/response correlation over one transport
//! - `protocol`     -- typed MCP session (`McpClient`) with its lifecycle
//! - `config`       -- server configuration structures
//! - `health`       -- per-server health records
//! - `manager`      -- connects, monitors and reconnects a set of servers
//! - `tool_adapter` -- wraps remote tools as `ToolExecutor`s

pub mod client;
pub mod config;
pub mod health;
pub mod manager;
pub mod protocol;
pub mod tool_adapter;
pub mod transport;
pub mod types;

pub use config::{McpConfig, McpServerConfig, TransportKind};
pub use manager::{McpManager, RegisteredTool, ServerStatus};
pub use protocol::{ClientState, McpClient};
pub use tool_adapter::McpToolAdapter;
