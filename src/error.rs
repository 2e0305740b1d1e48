//! Error types for mcpbridge
//!
//! This module defines all error types used throughout the crate,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for mcpbridge operations
///
/// Covers transport failures, protocol errors, timeouts and cancellation,
/// client lifecycle misuse, and configuration problems. Tool-reported
/// failures (`isError` results) are data, not errors, and never appear here.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tool execution errors raised by the adapter layer
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Transport-level failure (spawn, pipe I/O, HTTP status, closed queue)
    #[error("MCP transport error: {0}")]
    McpTransport(String),

    /// The transport or client was already closed
    #[error("MCP connection closed: {0}")]
    McpClosed(String),

    /// A request did not receive a response before its deadline
    #[error("MCP timeout: server={server}, method={method}")]
    McpTimeout {
        /// Server the request was sent to
        server: String,
        /// JSON-RPC method name
        method: String,
    },

    /// The caller cancelled a request before its response arrived
    #[error("MCP request cancelled: server={server}, method={method}")]
    McpCancelled {
        /// Server the request was sent to
        server: String,
        /// JSON-RPC method name
        method: String,
    },

    /// The server answered with a JSON-RPC error object
    #[error("MCP error {code}: {message}")]
    McpRpc {
        /// JSON-RPC error code, surfaced verbatim
        code: i64,
        /// Server-supplied error message
        message: String,
    },

    /// The server selected a protocol revision this client does not speak
    #[error("MCP protocol version mismatch: expected one of {expected:?}, got {got}")]
    McpProtocolVersion {
        /// Versions this client accepts
        expected: Vec<String>,
        /// Version the server returned
        got: String,
    },

    /// An operation requires a completed handshake
    #[error("MCP client not initialized: {0}")]
    McpNotInitialized(String),

    /// No server with the given name is configured or connected
    #[error("MCP server not found: {0}")]
    McpServerNotFound(String),

    /// Several independent operations failed; each failure is listed
    #[error("{operation} failed for {} server(s): {}", .failures.len(), format_failures(.failures))]
    Aggregate {
        /// Operation that was fanned out (e.g. "connect_all")
        operation: String,
        /// `(server name, error text)` per failed server
        failures: Vec<(String, String)>,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(server, error)| format!("{server}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for mcpbridge operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
