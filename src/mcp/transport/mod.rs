//! MCP transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that all MCP transport
//! implementations must satisfy. Concrete implementations live in
//! submodules:
//!
//! - [`stdio::StdioTransport`] -- spawns a child process and communicates
//!   over its stdin/stdout pipes (newline-delimited JSON).
//! - [`http::HttpTransport`] -- one POST per outbound message; response
//!   bodies (JSON or SSE) are pushed onto the same receive path.
//! - `fake::FakeTransport` -- in-process fake used in unit tests (cfg(test)
//!   only).
//!
//! # Design
//!
//! Messages cross the trait already decoded: `send` takes a
//! [`JsonRpcMessage`] and `receive` yields one. Framing, session handling
//! and child-process lifecycle belong to each implementation.
//!
//! `receive` has three outcomes:
//!
//! - `Ok(Some(msg))` -- one decoded message;
//! - `Ok(None)` -- end of stream, no further messages will arrive;
//! - `Err(_)` -- one malformed frame was dropped; the stream is still usable
//!   and the caller may keep reading.
//!
//! I/O failures on the inbound side are reported as end of stream, so a
//! caller looping on `receive` never spins on a broken pipe.

use crate::error::Result;
use crate::mcp::types::JsonRpcMessage;

pub mod env;
pub mod http;
pub mod stdio;

#[cfg(test)]
pub mod fake;

pub use env::EnvPolicy;
pub use http::HttpTransport;
pub use stdio::{StdioServerParams, StdioTransport};

/// Abstraction over MCP transport implementations.
///
/// Implementations exist for stdio (child process) and HTTP. The client
/// only ever holds one through `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Deliver one message to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::BridgeError::McpTransport`] if the underlying
    /// I/O fails, or [`crate::error::BridgeError::McpClosed`] after `close`.
    async fn send(&self, message: &JsonRpcMessage) -> Result<()>;

    /// Wait for the next inbound message.
    ///
    /// Only one caller is expected to read at a time; concurrent callers are
    /// serialized.
    async fn receive(&self) -> Result<Option<JsonRpcMessage>>;

    /// Release the underlying resources.
    ///
    /// Idempotent, and bounded in time: it never waits indefinitely on the
    /// peer.
    async fn close(&self) -> Result<()>;
}

/// Decode one inbound frame, mapping failures to a transport error that
/// names the peer.
pub(crate) fn decode_frame(server: &str, frame: &str) -> Result<JsonRpcMessage> {
    serde_json::from_str(frame).map_err(|e| {
        crate::error::BridgeError::McpTransport(format!(
            "malformed frame from MCP server `{}`: {}",
            server, e
        ))
        .into()
    })
}
