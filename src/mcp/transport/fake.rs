//! In-process fake transport for MCP unit tests
//!
//! [`FakeTransport::new`] returns a `(FakeTransport, FakeTransportHandle)`
//! pair joined by in-memory channels. Wire the transport into the code under
//! test and drive the other end from the handle:
//!
//! - read what the client sent: `handle.outbound_rx.recv().await`
//! - inject server traffic: `handle.inbound_tx.send(msg)`
//!
//! Dropping the handle ends the inbound stream, which looks to the client
//! exactly like a server process exiting.
//!
//! ```text
//! client send() -----> outbound_tx -----> outbound_rx (handle reads)
//! handle inbound_tx -----------------> inbound_rx  (client receive())
//! ```
//!
//! [`FakeServer`] builds on the pair: it answers the handshake, `tools/list`,
//! `tools/call` and `ping` from a scripted tool list.

use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::mcp::transport::Transport;
use crate::mcp::types::{
    JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, JsonSchema, McpTool,
    LATEST_PROTOCOL_VERSION, METHOD_NOT_FOUND,
};

/// In-process transport backed by channels.
#[derive(Debug)]
pub struct FakeTransport {
    outbound_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<JsonRpcMessage>>,
    closed: CancellationToken,
}

/// The test-side end of a [`FakeTransport`].
#[derive(Debug)]
pub struct FakeTransportHandle {
    /// Messages the client sent.
    pub outbound_rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
    /// Messages the client will receive.
    pub inbound_tx: mpsc::UnboundedSender<JsonRpcMessage>,
}

impl FakeTransport {
    /// Create a connected `(FakeTransport, FakeTransportHandle)` pair.
    pub fn new() -> (Self, FakeTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                closed: CancellationToken::new(),
            },
            FakeTransportHandle {
                outbound_rx,
                inbound_tx,
            },
        )
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl FakeTransportHandle {
    /// Inject a raw JSON value as inbound traffic.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a valid JSON-RPC message or the transport
    /// has been dropped.
    pub fn inject(&self, value: serde_json::Value) {
        let msg: JsonRpcMessage =
            serde_json::from_value(value).expect("FakeTransportHandle: invalid JSON-RPC message");
        self.inbound_tx
            .send(msg)
            .expect("FakeTransportHandle: transport dropped before inject");
    }

    /// Wait for the next outbound request, skipping notifications.
    pub async fn next_request(&mut self) -> Option<JsonRpcRequest> {
        while let Some(msg) = self.outbound_rx.recv().await {
            if let JsonRpcMessage::Request(req) = msg {
                return Some(req);
            }
        }
        None
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::McpClosed("fake transport closed".into()).into());
        }
        self.outbound_tx.send(message.clone()).map_err(|e| {
            BridgeError::McpTransport(format!("fake transport outbound channel closed: {}", e))
                .into()
        })
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            msg = rx.recv() => Ok(msg),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// A scripted MCP server living on the far side of a [`FakeTransport`].
#[derive(Debug, Clone)]
pub struct FakeServer {
    /// Tools returned from `tools/list`.
    pub tools: Vec<McpTool>,
    /// Answer `initialize` with an error instead of a result.
    pub fail_initialize: bool,
    /// Protocol version reported by `initialize`.
    pub protocol_version: String,
    /// Methods that never receive a response.
    pub silent_methods: Vec<String>,
    /// Delay before each response.
    pub latency: Duration,
}

impl Default for FakeServer {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            fail_initialize: false,
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            silent_methods: Vec::new(),
            latency: Duration::ZERO,
        }
    }
}

/// Controls for a running [`FakeServer`].
#[derive(Debug)]
pub struct FakeServerHandle {
    /// Cancel to make the server "crash": its inbound side closes.
    pub crash: CancellationToken,
    /// The serving task.
    pub task: JoinHandle<()>,
}

impl FakeServer {
    /// A server exposing one object-schema tool per name.
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|n| fake_tool(n)).collect(),
            ..Self::default()
        }
    }

    /// Start serving and return the client-side transport.
    pub fn spawn(self) -> (FakeTransport, FakeServerHandle) {
        let (transport, mut handle) = FakeTransport::new();
        let crash = CancellationToken::new();
        let token = crash.clone();
        let task = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => break,
                    msg = handle.outbound_rx.recv() => msg,
                };
                let req = match msg {
                    Some(JsonRpcMessage::Request(req)) => req,
                    Some(_) => continue,
                    None => break,
                };
                if self.silent_methods.iter().any(|m| m == &req.method) {
                    continue;
                }
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }
                let reply = self.answer(req);
                if handle.inbound_tx.send(JsonRpcMessage::Response(reply)).is_err() {
                    break;
                }
            }
        });
        (transport, FakeServerHandle { crash, task })
    }

    fn answer(&self, req: JsonRpcRequest) -> JsonRpcResponse {
        let id = req.id.clone();
        match req.method.as_str() {
            "initialize" if self.fail_initialize => {
                JsonRpcResponse::failure(id, JsonRpcError::new(-32603, "initialize refused"))
            }
            "initialize" => JsonRpcResponse::success(
                id,
                serde_json::json!({
                    "protocolVersion": self.protocol_version,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-server", "version": "0.0.1"}
                }),
            ),
            "tools/list" => JsonRpcResponse::success(
                id,
                serde_json::json!({ "tools": self.tools }),
            ),
            "tools/call" => {
                let params = req.params.unwrap_or_default();
                let name = params.get("name").and_then(|v| v.as_str()).unwrap_or("");
                let args = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                if name == "fail" {
                    JsonRpcResponse::success(
                        id,
                        serde_json::json!({
                            "content": [{"type": "text", "text": "tool failed"}],
                            "isError": true
                        }),
                    )
                } else {
                    JsonRpcResponse::success(
                        id,
                        serde_json::json!({
                            "content": [{"type": "text", "text": format!("{name}: {args}")}]
                        }),
                    )
                }
            }
            "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
            other => JsonRpcResponse::failure(
                id,
                JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {other}")),
            ),
        }
    }
}

/// A tool descriptor with an empty object schema.
pub fn fake_tool(name: &str) -> McpTool {
    McpTool {
        name: name.to_string(),
        title: None,
        description: Some(format!("{name} tool")),
        input_schema: JsonSchema::object(),
        annotations: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::RequestId;

    #[tokio::test]
    async fn test_send_delivers_to_handle() {
        let (transport, mut handle) = FakeTransport::new();
        transport
            .send(&JsonRpcMessage::notification("notifications/initialized", None))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), handle.outbound_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(received.method(), Some("notifications/initialized"));
    }

    #[tokio::test]
    async fn test_dropping_handle_ends_inbound_stream() {
        let (transport, handle) = FakeTransport::new();
        handle.inject(serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {}}));
        drop(handle);

        assert!(transport.receive().await.unwrap().is_some());
        assert!(transport.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_ends_receive_and_rejects_send() {
        let (transport, _handle) = FakeTransport::new();
        transport.close().await.unwrap();
        assert!(transport.is_closed());
        assert!(transport.receive().await.unwrap().is_none());
        assert!(transport
            .send(&JsonRpcMessage::notification("x", None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fake_server_answers_ping() {
        let (transport, _server) = FakeServer::default().spawn();
        transport
            .send(&JsonRpcMessage::request(RequestId::Number(5), "ping", None))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), transport.receive())
            .await
            .expect("timed out")
            .unwrap()
            .unwrap();
        assert_eq!(reply.id(), Some(&RequestId::Number(5)));
    }

    #[tokio::test]
    async fn test_fake_server_crash_ends_stream() {
        let (transport, server) = FakeServer::default().spawn();
        server.crash.cancel();
        let next = tokio::time::timeout(Duration::from_secs(2), transport.receive())
            .await
            .expect("timed out")
            .unwrap();
        assert!(next.is_none());
    }
}
