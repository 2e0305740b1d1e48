//! Request correlation over an MCP transport
//!
//! This module provides [`JsonRpcClient`], which turns a message-oriented
//! [`Transport`] into request/response calls. One background receive loop
//! per client reads the transport and dispatches every inbound message:
//!
//! - **Response**: resolves the matching pending `oneshot` sender. Responses
//!   for ids no longer pending (late arrivals after a timeout or
//!   cancellation) are logged at debug and dropped.
//! - **Server-initiated request**: `ping` is answered with an empty result;
//!   everything else gets `-32601 Method not found`.
//! - **Notification**: logged.
//! - **Malformed frame**: logged and skipped.
//!
//! When the transport reaches end of stream the loop exits, marks the client
//! dead and drops every pending sender so waiting callers fail immediately.
//!
//! # Pending table
//!
//! Each call registers its `oneshot` sender before the request is sent and
//! holds a guard that removes the entry on every exit path (response,
//! timeout, cancellation, send failure). Removal is idempotent, so the table
//! never leaks entries regardless of which outcome wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::mcp::transport::Transport;
use crate::mcp::types::{
    JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId, METHOD_NOT_FOUND,
    METHOD_PING,
};

/// Default timeout applied to every request when the caller does not specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `close` waits for the receive loop to exit.
const LOOP_EXIT_WAIT: Duration = Duration::from_secs(2);

type RpcOutcome = std::result::Result<serde_json::Value, JsonRpcError>;

/// Request id -> delivery slot for the matching response.
#[derive(Debug, Default)]
struct PendingTable {
    slots: Mutex<HashMap<u64, oneshot::Sender<RpcOutcome>>>,
}

impl PendingTable {
    fn insert(&self, id: u64, tx: oneshot::Sender<RpcOutcome>) {
        self.slots.lock().insert(id, tx);
    }

    fn take(&self, id: u64) -> Option<oneshot::Sender<RpcOutcome>> {
        self.slots.lock().remove(&id)
    }

    fn clear(&self) {
        self.slots.lock().clear();
    }

    fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Removes a pending entry when the request future finishes or is dropped.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.take(self.id);
    }
}

/// JSON-RPC 2.0 client bound to one transport.
///
/// Creating a client spawns its receive loop, so it must be constructed
/// inside a Tokio runtime.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use mcpbridge::mcp::client::JsonRpcClient;
/// use mcpbridge::mcp::transport::{StdioServerParams, StdioTransport};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = Arc::new(StdioTransport::spawn(StdioServerParams::new("fs", "my-server"))?);
/// let client = JsonRpcClient::new("fs", transport);
/// let pong: serde_json::Value = client
///     .request(&CancellationToken::new(), "ping", serde_json::json!({}), None)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct JsonRpcClient {
    server: String,
    transport: Arc<dyn Transport>,
    /// Monotonically increasing request ID counter, starting at 1.
    next_id: AtomicU64,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
    default_timeout: Duration,
    loop_cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcClient")
            .field("server", &self.server)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("pending", &self.pending.len())
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl JsonRpcClient {
    /// Wrap `transport` and start the receive loop.
    pub fn new(server: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let server = server.into();
        let pending = Arc::new(PendingTable::default());
        let alive = Arc::new(AtomicBool::new(true));
        let loop_cancel = CancellationToken::new();

        let handle = start_receive_loop(
            server.clone(),
            Arc::clone(&transport),
            Arc::clone(&pending),
            Arc::clone(&alive),
            loop_cancel.clone(),
        );

        Self {
            server,
            transport,
            next_id: AtomicU64::new(1),
            pending,
            alive,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            loop_cancel,
            loop_handle: Mutex::new(Some(handle)),
        }
    }

    /// Replace the timeout used when a request passes `None`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Name of the server this client talks to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Whether the receive loop is still running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and await its typed result.
    ///
    /// The call completes with whichever happens first: the response, the
    /// timeout (`timeout` or the client default), or cancellation of `ct`.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::McpClosed`] if the receive loop has exited, before or
    ///   during the call;
    /// - [`BridgeError::McpTimeout`] / [`BridgeError::McpCancelled`];
    /// - [`BridgeError::McpRpc`] when the server answers with an error object;
    /// - [`BridgeError::Serialization`] if params or result do not convert.
    pub async fn request<P, R>(
        &self,
        ct: &CancellationToken,
        method: &str,
        params: P,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        P: serde::Serialize + Send,
        R: serde::de::DeserializeOwned,
    {
        if !self.is_alive() {
            return Err(BridgeError::McpClosed(format!(
                "connection to MCP server `{}` is closed",
                self.server
            ))
            .into());
        }

        let params = serde_json::to_value(params)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _guard = PendingGuard {
            table: &self.pending,
            id,
        };

        let message = JsonRpcMessage::request(RequestId::Number(id), method, Some(params));

        // Send and response wait share one deadline and one cancellation token.
        let exchange = async {
            self.transport.send(&message).await?;
            // The sender was dropped: the receive loop exited before answering.
            rx.await.map_err(|_| {
                anyhow::Error::from(BridgeError::McpClosed(format!(
                    "MCP server `{}` disconnected before answering {}",
                    self.server, method
                )))
            })
        };

        let deadline = timeout.unwrap_or(self.default_timeout);
        let rpc_result = tokio::select! {
            outcome = exchange => outcome?,
            _ = tokio::time::sleep(deadline) => {
                tracing::debug!(server = %self.server, method, id, "MCP request timed out");
                return Err(BridgeError::McpTimeout {
                    server: self.server.clone(),
                    method: method.to_string(),
                }
                .into());
            }
            _ = ct.cancelled() => {
                return Err(BridgeError::McpCancelled {
                    server: self.server.clone(),
                    method: method.to_string(),
                }
                .into());
            }
        };

        let value = rpc_result.map_err(|e| BridgeError::McpRpc {
            code: e.code,
            message: e.message,
        })?;

        serde_json::from_value(value).map_err(|e| BridgeError::Serialization(e).into())
    }

    /// Send a notification; no response is expected.
    pub async fn notify<P: serde::Serialize + Send>(&self, method: &str, params: P) -> Result<()> {
        let params = serde_json::to_value(params)?;
        self.transport
            .send(&JsonRpcMessage::notification(method, Some(params)))
            .await
    }

    /// Stop the receive loop and close the transport.
    ///
    /// Waits at most two seconds for the loop to exit. Safe to call more than
    /// once.
    pub async fn close(&self) -> Result<()> {
        self.loop_cancel.cancel();
        let handle = self.loop_handle.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(LOOP_EXIT_WAIT, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(server = %self.server, "receive loop did not stop in time; aborting");
                handle.abort();
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        self.pending.clear();
        self.transport.close().await
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        self.loop_cancel.cancel();
    }
}

/// Spawn the receive loop for one client.
fn start_receive_loop(
    server: String,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingTable>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = transport.receive() => next,
            };
            match next {
                Ok(Some(msg)) => dispatch_message(&server, transport.as_ref(), &pending, msg).await,
                Ok(None) => {
                    tracing::debug!(server = %server, "MCP transport reached end of stream");
                    break;
                }
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "skipping malformed MCP frame");
                }
            }
        }
        alive.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiting caller with a closed error.
        pending.clear();
    })
}

/// Route one inbound message.
async fn dispatch_message(
    server: &str,
    transport: &dyn Transport,
    pending: &PendingTable,
    msg: JsonRpcMessage,
) {
    match msg {
        JsonRpcMessage::Response(resp) => handle_response(server, pending, resp),
        JsonRpcMessage::Request(req) => handle_server_request(server, transport, req).await,
        JsonRpcMessage::Notification(n) => {
            tracing::debug!(server = %server, method = %n.method, "MCP notification");
        }
    }
}

fn handle_response(server: &str, pending: &PendingTable, resp: JsonRpcResponse) {
    let Some(id) = resp.id.as_u64() else {
        tracing::warn!(server = %server, id = %resp.id, "MCP response has non-integer id");
        return;
    };

    let Some(tx) = pending.take(id) else {
        tracing::debug!(server = %server, id, "received response for unknown id; ignoring");
        return;
    };

    let outcome = match (resp.error, resp.result) {
        (Some(error), _) => Err(error),
        (None, Some(result)) => Ok(result),
        (None, None) => Ok(serde_json::Value::Null),
    };

    // The caller may already have given up; that is fine.
    let _ = tx.send(outcome);
}

async fn handle_server_request(server: &str, transport: &dyn Transport, req: JsonRpcRequest) {
    let reply = if req.method == METHOD_PING {
        JsonRpcResponse::success(req.id, serde_json::json!({}))
    } else {
        tracing::debug!(server = %server, method = %req.method, "rejecting server-initiated request");
        JsonRpcResponse::failure(
            req.id,
            JsonRpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", req.method)),
        )
    };
    if let Err(e) = transport.send(&JsonRpcMessage::Response(reply)).await {
        tracing::warn!(server = %server, error = %e, "failed to answer server request");
    }
}
