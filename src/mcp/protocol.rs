//! Typed MCP session over [`JsonRpcClient`]
//!
//! [`McpClient`] owns one transport (through its [`JsonRpcClient`]) and walks
//! a small lifecycle:
//!
//! ```text
//! Unconnected --initialize--> Initializing --ok--> Ready --close--> Closed
//!                                  |
//!                                  +--error--> Failed
//! ```
//!
//! There is no way back: a `Failed` or `Closed` client is discarded and a new
//! one built. Every MCP operation other than `initialize` and `close` fails
//! fast unless the client is `Ready`.
//!
//! List operations follow `nextCursor` until the server stops returning
//! one, accumulating results before returning.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::mcp::client::JsonRpcClient;
use crate::mcp::transport::Transport;
use crate::mcp::types::{
    CallToolParams, CallToolResponse, ClientCapabilities, Implementation, InitializeParams,
    InitializeResponse, ListPromptsResponse, ListResourcesResponse, ListToolsResponse, McpTool,
    PaginatedParams, Prompt, ReadResourceParams, ReadResourceResponse, Resource, ResourceContents,
    ServerCapabilities, LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_PING, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ,
    METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Identifies a specific capability that may be advertised by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCapabilityFlag {
    /// Server exposes tools via `tools/list` and `tools/call`.
    Tools,
    /// Server exposes resources via `resources/list` and `resources/read`.
    Resources,
    /// Server exposes prompts via `prompts/list`.
    Prompts,
    /// Server emits log notifications.
    Logging,
    /// Server advertises experimental capabilities.
    Experimental,
}

/// Lifecycle state of an [`McpClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// Transport open, handshake not started.
    Unconnected,
    /// `initialize` in flight.
    Initializing,
    /// Handshake complete; all operations available.
    Ready,
    /// Handshake failed.
    Failed,
    /// `close` was called.
    Closed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientState::Unconnected => "unconnected",
            ClientState::Initializing => "initializing",
            ClientState::Ready => "ready",
            ClientState::Failed => "failed",
            ClientState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One MCP session with one server.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use mcpbridge::mcp::protocol::McpClient;
/// use mcpbridge::mcp::transport::{StdioServerParams, StdioTransport};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = StdioTransport::spawn(StdioServerParams::new("fs", "my-mcp-server"))?;
/// let client = McpClient::new("fs", Arc::new(transport));
/// let ct = CancellationToken::new();
/// client.initialize(&ct).await?;
/// for tool in client.list_tools(&ct).await? {
///     println!("{}", tool.name);
/// }
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct McpClient {
    rpc: JsonRpcClient,
    client_info: Implementation,
    state: Mutex<ClientState>,
    session: RwLock<Option<InitializeResponse>>,
    /// Serializes concurrent `initialize` calls.
    handshake: tokio::sync::Mutex<()>,
    consecutive_failures: AtomicU32,
}

impl McpClient {
    /// Create a client for `server` over `transport`.
    ///
    /// Starts the receive loop immediately; must be called inside a Tokio
    /// runtime.
    pub fn new(server: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            rpc: JsonRpcClient::new(server, transport),
            client_info: Implementation::this_client(),
            state: Mutex::new(ClientState::Unconnected),
            session: RwLock::new(None),
            handshake: tokio::sync::Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Default per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.rpc = self.rpc.with_default_timeout(timeout);
        self
    }

    /// Identity sent during the handshake.
    pub fn with_client_info(mut self, info: Implementation) -> Self {
        self.client_info = info;
        self
    }

    /// Server name.
    pub fn server_name(&self) -> &str {
        self.rpc.server()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    fn set_state(&self, state: ClientState) {
        *self.state.lock() = state;
    }

    /// Perform the `initialize` / `notifications/initialized` handshake.
    ///
    /// A second call on a `Ready` client returns `Ok(())` without touching
    /// the wire.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::McpProtocolVersion`] if the server selects an
    /// unsupported protocol revision, and any request error from the
    /// `initialize` call itself. On error the client moves to `Failed`.
    pub async fn initialize(&self, ct: &CancellationToken) -> Result<()> {
        let _serialized = self.handshake.lock().await;
        match self.state() {
            ClientState::Ready => return Ok(()),
            ClientState::Failed => {
                return Err(BridgeError::McpNotInitialized(format!(
                    "handshake with MCP server `{}` already failed",
                    self.server_name()
                ))
                .into())
            }
            ClientState::Closed => return Err(self.closed_error().into()),
            ClientState::Unconnected | ClientState::Initializing => {}
        }

        self.set_state(ClientState::Initializing);
        match self.handshake(ct).await {
            Ok(response) => {
                tracing::info!(
                    server = %self.server_name(),
                    server_name = %response.server_info.name,
                    server_version = %response.server_info.version,
                    protocol = %response.protocol_version,
                    "MCP session ready"
                );
                *self.session.write() = Some(response);
                self.set_state(ClientState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(ClientState::Failed);
                Err(e)
            }
        }
    }

    async fn handshake(&self, ct: &CancellationToken) -> Result<InitializeResponse> {
        let response: InitializeResponse = self
            .rpc
            .request(
                ct,
                METHOD_INITIALIZE,
                InitializeParams {
                    protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                    capabilities: ClientCapabilities::default(),
                    client_info: self.client_info.clone(),
                },
                None,
            )
            .await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&response.protocol_version.as_str()) {
            return Err(BridgeError::McpProtocolVersion {
                expected: SUPPORTED_PROTOCOL_VERSIONS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                got: response.protocol_version,
            }
            .into());
        }

        // Fire-and-forget; a broken pipe surfaces on the next request.
        if let Err(e) = self.rpc.notify(METHOD_INITIALIZED, serde_json::json!({})).await {
            tracing::warn!(server = %self.server_name(), error = %e, "failed to send initialized notification");
        }

        Ok(response)
    }

    fn closed_error(&self) -> BridgeError {
        BridgeError::McpClosed(format!("MCP client `{}` is closed", self.server_name()))
    }

    fn ensure_ready(&self, operation: &str) -> Result<()> {
        match self.state() {
            ClientState::Ready => Ok(()),
            ClientState::Closed => Err(self.closed_error().into()),
            state => Err(BridgeError::McpNotInitialized(format!(
                "cannot {} on MCP server `{}` in state {}",
                operation,
                self.server_name(),
                state
            ))
            .into()),
        }
    }

    /// Server identity from the handshake.
    pub fn server_info(&self) -> Option<Implementation> {
        self.session.read().as_ref().map(|s| s.server_info.clone())
    }

    /// Capabilities the server advertised.
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.session.read().as_ref().map(|s| s.capabilities.clone())
    }

    /// Free-form instructions the server sent with its handshake.
    pub fn instructions(&self) -> Option<String> {
        self.session.read().as_ref().and_then(|s| s.instructions.clone())
    }

    /// Protocol revision the server selected.
    pub fn protocol_version(&self) -> Option<String> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.protocol_version.clone())
    }

    /// Check whether the server advertises a specific capability.
    pub fn capable(&self, capability: ServerCapabilityFlag) -> bool {
        let session = self.session.read();
        let Some(caps) = session.as_ref().map(|s| &s.capabilities) else {
            return false;
        };
        match capability {
            ServerCapabilityFlag::Tools => caps.tools.is_some(),
            ServerCapabilityFlag::Resources => caps.resources.is_some(),
            ServerCapabilityFlag::Prompts => caps.prompts.is_some(),
            ServerCapabilityFlag::Logging => caps.logging.is_some(),
            ServerCapabilityFlag::Experimental => caps.experimental.is_some(),
        }
    }

    /// List all tools advertised by the server, following pagination.
    pub async fn list_tools(&self, ct: &CancellationToken) -> Result<Vec<McpTool>> {
        self.ensure_ready("list tools")?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let resp: ListToolsResponse = self
                .rpc
                .request(ct, METHOD_TOOLS_LIST, PaginatedParams { cursor }, None)
                .await?;

            tools.extend(resp.tools);

            match resp.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Invoke a named tool.
    ///
    /// A tool that reports failure (`isError: true`) still returns `Ok`; the
    /// flag is part of the response.
    pub async fn call_tool(
        &self,
        ct: &CancellationToken,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResponse> {
        self.ensure_ready("call tool")?;
        self.rpc
            .request(
                ct,
                METHOD_TOOLS_CALL,
                CallToolParams {
                    name: name.to_string(),
                    arguments,
                },
                None,
            )
            .await
    }

    /// List all resources, following pagination.
    pub async fn list_resources(&self, ct: &CancellationToken) -> Result<Vec<Resource>> {
        self.ensure_ready("list resources")?;
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let resp: ListResourcesResponse = self
                .rpc
                .request(ct, METHOD_RESOURCES_LIST, PaginatedParams { cursor }, None)
                .await?;

            resources.extend(resp.resources);

            match resp.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(resources)
    }

    /// Read one resource by URI.
    pub async fn read_resource(
        &self,
        ct: &CancellationToken,
        uri: &str,
    ) -> Result<Vec<ResourceContents>> {
        self.ensure_ready("read resource")?;
        let resp: ReadResourceResponse = self
            .rpc
            .request(
                ct,
                METHOD_RESOURCES_READ,
                ReadResourceParams {
                    uri: uri.to_string(),
                },
                None,
            )
            .await?;
        Ok(resp.contents)
    }

    /// List all prompts, following pagination.
    pub async fn list_prompts(&self, ct: &CancellationToken) -> Result<Vec<Prompt>> {
        self.ensure_ready("list prompts")?;
        let mut prompts = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let resp: ListPromptsResponse = self
                .rpc
                .request(ct, METHOD_PROMPTS_LIST, PaginatedParams { cursor }, None)
                .await?;

            prompts.extend(resp.prompts);

            match resp.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(prompts)
    }

    /// Round-trip a `ping`.
    pub async fn ping(&self, ct: &CancellationToken) -> Result<()> {
        self.ensure_ready("ping")?;
        let _: serde_json::Value = self
            .rpc
            .request(ct, METHOD_PING, serde_json::json!({}), None)
            .await?;
        Ok(())
    }

    /// Stop the receive loop and close the transport.
    ///
    /// Valid in any state, including before `initialize`. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.state() == ClientState::Closed {
            return Ok(());
        }
        self.set_state(ClientState::Closed);
        self.rpc.close().await
    }

    /// Whether the receive loop is still running.
    pub fn is_alive(&self) -> bool {
        self.rpc.is_alive()
    }

    /// Requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.rpc.pending_count()
    }

    /// Count one failed call; returns the new streak length.
    pub fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Count a failed call unless the caller cancelled it.
    ///
    /// Returns the new streak length, or `None` for a cancellation, which
    /// says nothing about the server.
    pub fn record_call_error(&self, error: &anyhow::Error) -> Option<u32> {
        match error.downcast_ref::<BridgeError>() {
            Some(BridgeError::McpCancelled { .. }) => None,
            _ => Some(self.record_failure()),
        }
    }

    /// Reset the failure streak.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Current failure streak.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::fake::{fake_tool, FakeServer, FakeTransport, FakeTransportHandle};
    use crate::mcp::types::{JsonRpcMessage, JsonRpcResponse};

    fn wired_client() -> (McpClient, FakeTransportHandle) {
        let (transport, handle) = FakeTransport::new();
        (McpClient::new("test", Arc::new(transport)), handle)
    }

    fn ready_client(server: FakeServer) -> McpClient {
        let (transport, _server) = server.spawn();
        McpClient::new("test", Arc::new(transport))
    }

    #[tokio::test]
    async fn test_operations_fail_fast_before_initialize() {
        let (client, _handle) = wired_client();
        let ct = CancellationToken::new();

        let err = client.list_tools(&ct).await.unwrap_err();
        assert!(err.to_string().contains("not initialized"), "got: {err}");
        assert!(client.ping(&ct).await.is_err());
        assert!(client.call_tool(&ct, "x", None).await.is_err());
        assert_eq!(client.state(), ClientState::Unconnected);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_sends_latest_version_then_initialized() {
        let (client, mut handle) = wired_client();
        let ct = CancellationToken::new();

        let server = tokio::spawn(async move {
            let req = handle.next_request().await.unwrap();
            assert_eq!(req.method, METHOD_INITIALIZE);
            let params = req.params.clone().unwrap();
            assert_eq!(params["protocolVersion"], LATEST_PROTOCOL_VERSION);
            assert_eq!(params["clientInfo"]["name"], env!("CARGO_PKG_NAME"));
            let _ = handle.inbound_tx.send(JsonRpcMessage::Response(JsonRpcResponse::success(
                req.id,
                serde_json::json!({
                    "protocolVersion": LATEST_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "srv", "version": "2.0"},
                    "instructions": "be nice"
                }),
            )));
            let next = handle.outbound_rx.recv().await.unwrap();
            assert_eq!(next.method(), Some(METHOD_INITIALIZED));
            assert!(next.is_notification());
            handle
        });

        client.initialize(&ct).await.unwrap();
        let _handle = server.await.unwrap();

        assert_eq!(client.state(), ClientState::Ready);
        assert_eq!(client.server_info().unwrap().name, "srv");
        assert_eq!(client.instructions().as_deref(), Some("be nice"));
        assert!(client.capable(ServerCapabilityFlag::Tools));
        assert!(!client.capable(ServerCapabilityFlag::Resources));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let client = ready_client(FakeServer::default());
        let ct = CancellationToken::new();
        client.initialize(&ct).await.unwrap();
        client.initialize(&ct).await.unwrap();
        assert_eq!(client.state(), ClientState::Ready);
    }

    #[tokio::test]
    async fn test_initialize_rejects_unsupported_protocol_version() {
        let client = ready_client(FakeServer {
            protocol_version: "1999-01-01".to_string(),
            ..FakeServer::default()
        });
        let ct = CancellationToken::new();

        let err = client.initialize(&ct).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::McpProtocolVersion { got, .. }) if got == "1999-01-01"
        ));
        assert_eq!(client.state(), ClientState::Failed);
        assert!(client.initialize(&ct).await.is_err());
    }

    #[tokio::test]
    async fn test_initialize_error_response_marks_failed() {
        let client = ready_client(FakeServer {
            fail_initialize: true,
            ..FakeServer::default()
        });
        let err = client.initialize(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("initialize refused"));
        assert_eq!(client.state(), ClientState::Failed);
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor_pagination() {
        let (client, mut handle) = wired_client();
        let ct = CancellationToken::new();

        let server = tokio::spawn(async move {
            let init = handle.next_request().await.unwrap();
            let _ = handle.inbound_tx.send(JsonRpcMessage::Response(JsonRpcResponse::success(
                init.id,
                serde_json::json!({
                    "protocolVersion": LATEST_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "srv", "version": "1"}
                }),
            )));

            let first = handle.next_request().await.unwrap();
            assert!(first.params.as_ref().unwrap().get("cursor").is_none());
            let _ = handle.inbound_tx.send(JsonRpcMessage::Response(JsonRpcResponse::success(
                first.id,
                serde_json::json!({
                    "tools": [{"name": "tool_a", "inputSchema": {}}],
                    "nextCursor": "page2"
                }),
            )));

            let second = handle.next_request().await.unwrap();
            assert_eq!(second.params.as_ref().unwrap()["cursor"], "page2");
            let _ = handle.inbound_tx.send(JsonRpcMessage::Response(JsonRpcResponse::success(
                second.id,
                serde_json::json!({
                    "tools": [{"name": "tool_b", "inputSchema": {}}],
                    "nextCursor": null
                }),
            )));
            handle
        });

        client.initialize(&ct).await.unwrap();
        let tools = client.list_tools(&ct).await.unwrap();
        let _handle = server.await.unwrap();

        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "tool_a");
        assert_eq!(tools[1].name, "tool_b");
    }

    #[tokio::test]
    async fn test_call_tool_surfaces_is_error_as_data() {
        let client = ready_client(FakeServer {
            tools: vec![fake_tool("fail")],
            ..FakeServer::default()
        });
        let ct = CancellationToken::new();
        client.initialize(&ct).await.unwrap();

        let resp = client.call_tool(&ct, "fail", None).await.unwrap();
        assert!(resp.is_error());
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let client = ready_client(FakeServer::default());
        let ct = CancellationToken::new();
        client.initialize(&ct).await.unwrap();
        client.ping(&ct).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_before_initialize_is_safe_and_idempotent() {
        let (client, _handle) = wired_client();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), ClientState::Closed);

        let err = client.initialize(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
        let err = client.list_tools(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn test_failure_counter() {
        let (client, _handle) = wired_client();
        assert_eq!(client.record_failure(), 1);
        assert_eq!(client.record_failure(), 2);
        assert_eq!(client.consecutive_failures(), 2);
        client.record_success();
        assert_eq!(client.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_server_failure() {
        let (client, _handle) = wired_client();
        let cancelled = anyhow::Error::from(BridgeError::McpCancelled {
            server: "fake".to_string(),
            method: "tools/call".to_string(),
        })
        .context("calling tool");
        assert_eq!(client.record_call_error(&cancelled), None);

        let timed_out = anyhow::Error::from(BridgeError::McpTimeout {
            server: "fake".to_string(),
            method: "tools/call".to_string(),
        });
        assert_eq!(client.record_call_error(&timed_out), Some(1));
        assert_eq!(client.consecutive_failures(), 1);
    }
}
