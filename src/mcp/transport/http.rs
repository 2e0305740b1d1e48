//! HTTP transport for remote MCP servers
//!
//! This module implements [`HttpTransport`]. Every outbound JSON-RPC message
//! is sent as one HTTP POST. The server may reply with:
//!
//! - `application/json` -- a direct JSON body (one message or a batch array)
//! - `text/event-stream` -- an SSE stream carrying one or more JSON-RPC
//!   messages
//! - `202 Accepted` -- an acknowledgement with no body (used for
//!   notifications)
//!
//! Whatever arrives in a response body is decoded and pushed onto an internal
//! queue, which [`Transport::receive`] drains. Request correlation happens
//! above this layer, by id.
//!
//! # Session management
//!
//! When a response carries an `MCP-Session-Id` header the value is stored
//! and attached to every subsequent POST. A `404` while a session is active
//! clears the session. `close` (or, failing that, `Drop`) sends a DELETE to
//! end the session on the server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::mcp::transport::{decode_frame, Transport};
use crate::mcp::types::{JsonRpcMessage, LATEST_PROTOCOL_VERSION};

/// Header carrying the session identifier.
const SESSION_HEADER: &str = "MCP-Session-Id";

/// Upper bound for the session DELETE issued on close.
const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

type Inbound = Result<JsonRpcMessage>;

/// HTTP transport: one POST per message, responses fed to `receive`.
///
/// # Examples
///
/// ```no_run
/// use std::collections::HashMap;
/// use std::time::Duration;
/// use mcpbridge::mcp::transport::HttpTransport;
///
/// # fn main() -> anyhow::Result<()> {
/// let transport = HttpTransport::new(
///     "remote",
///     url::Url::parse("http://localhost:3000/mcp")?,
///     HashMap::new(),
///     Duration::from_secs(30),
/// )?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct HttpTransport {
    name: String,
    http_client: reqwest::Client,
    /// MCP endpoint URL (POST target).
    endpoint: url::Url,
    /// Static extra headers merged into every request (e.g. Authorization).
    headers: HashMap<String, String>,
    protocol_version: String,
    session_id: RwLock<Option<String>>,
    /// Last SSE event id seen, replayed as `Last-Event-ID`.
    last_event_id: Arc<RwLock<Option<String>>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    closed: CancellationToken,
}

impl HttpTransport {
    /// Construct a new [`HttpTransport`] targeting `endpoint`.
    ///
    /// `timeout` bounds each individual POST. No network I/O is performed at
    /// construction time.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Http`] if the HTTP client cannot be built
    /// (TLS backend initialisation failure).
    pub fn new(
        name: impl Into<String>,
        endpoint: url::Url,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(BridgeError::Http)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            name: name.into(),
            http_client,
            endpoint,
            headers,
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            session_id: RwLock::new(None),
            last_event_id: Arc::new(RwLock::new(None)),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            closed: CancellationToken::new(),
        })
    }

    /// The active session id, if the server assigned one.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    /// The endpoint this transport posts to.
    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }

    fn push_body(&self, body: &str) {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return;
        }
        if trimmed.starts_with('[') {
            match serde_json::from_str::<Vec<JsonRpcMessage>>(trimmed) {
                Ok(batch) => {
                    for msg in batch {
                        let _ = self.inbound_tx.send(Ok(msg));
                    }
                }
                Err(e) => {
                    let _ = self.inbound_tx.send(Err(BridgeError::McpTransport(format!(
                        "malformed batch from MCP server `{}`: {}",
                        self.name, e
                    ))
                    .into()));
                }
            }
            return;
        }
        let _ = self.inbound_tx.send(decode_frame(&self.name, trimmed));
    }

    async fn delete_session(&self, session_id: String) {
        let mut req = self
            .http_client
            .delete(self.endpoint.as_str())
            .timeout(DELETE_TIMEOUT)
            .header(SESSION_HEADER, session_id.as_str());
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        match req.send().await {
            Ok(resp) => {
                tracing::debug!(server = %self.name, status = %resp.status(), "MCP session deleted");
            }
            Err(e) => {
                tracing::debug!(server = %self.name, error = %e, "MCP session delete failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    /// POST one message to the endpoint.
    ///
    /// Headers on every POST:
    ///
    /// - `Content-Type: application/json`
    /// - `Accept: application/json, text/event-stream`
    /// - `MCP-Protocol-Version: <latest>`
    /// - `MCP-Session-Id: <id>` -- only when a session is active
    /// - `Last-Event-ID: <id>` -- only when an SSE event id has been seen
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::McpClosed`] after `close`, and
    /// [`BridgeError::McpTransport`] for connection failures and non-2xx
    /// statuses.
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BridgeError::McpClosed(format!(
                "HTTP transport for MCP server `{}` is closed",
                self.name
            ))
            .into());
        }

        let body = serde_json::to_vec(message)?;
        let mut req = self
            .http_client
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", &self.protocol_version)
            .body(body);

        if let Some(id) = self.session_id() {
            req = req.header(SESSION_HEADER, id);
        }
        let last_event_id = self.last_event_id.read().clone();
        if let Some(id) = last_event_id {
            req = req.header("Last-Event-ID", id);
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let response = req.send().await.map_err(|e| {
            BridgeError::McpTransport(format!(
                "HTTP POST to MCP server `{}` failed: {}",
                self.name, e
            ))
        })?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            let www_auth = response
                .headers()
                .get("WWW-Authenticate")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(BridgeError::McpTransport(format!(
                "MCP server `{}` rejected credentials (HTTP 401) {}",
                self.name, www_auth
            ))
            .into());
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            let expired = self.session_id.write().take();
            if expired.is_some() {
                return Err(BridgeError::McpTransport(format!(
                    "MCP session for server `{}` expired",
                    self.name
                ))
                .into());
            }
            return Err(BridgeError::McpTransport(format!(
                "MCP server `{}` returned HTTP 404 Not Found",
                self.name
            ))
            .into());
        }

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        if !status.is_success() {
            return Err(BridgeError::McpTransport(format!(
                "MCP server `{}` returned HTTP {}",
                self.name, status
            ))
            .into());
        }

        if let Some(new_session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
        {
            let mut sid = self.session_id.write();
            if sid.is_none() {
                tracing::debug!(server = %self.name, session = %new_session_id, "MCP session established");
                *sid = Some(new_session_id);
            }
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let byte_stream = response.bytes_stream();
            let tx = self.inbound_tx.clone();
            let last_event_id = Arc::clone(&self.last_event_id);
            let closed = self.closed.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = closed.cancelled() => {}
                    _ = parse_sse_stream(&name, byte_stream, tx, last_event_id) => {}
                }
            });
        } else {
            let body = response.text().await.map_err(|e| {
                BridgeError::McpTransport(format!(
                    "failed to read response body from MCP server `{}`: {}",
                    self.name, e
                ))
            })?;
            self.push_body(&body);
        }

        Ok(())
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            item = rx.recv() => match item {
                Some(Ok(msg)) => Ok(Some(msg)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            },
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let session = self.session_id.write().take();
        if let Some(session_id) = session {
            self.delete_session(session_id).await;
        }
        Ok(())
    }
}

impl Drop for HttpTransport {
    /// Terminate a still-open session with a DELETE from a helper thread.
    ///
    /// Only reached when the transport was dropped without `close`. The
    /// blocking client runs on its own thread so the async runtime is never
    /// blocked; failures are ignored.
    fn drop(&mut self) {
        let Some(sid) = self.session_id.get_mut().take() else {
            return;
        };

        let endpoint = self.endpoint.as_str().to_string();
        let mut extra_headers = self.headers.clone();
        extra_headers.insert(SESSION_HEADER.to_string(), sid);

        let _ = std::thread::spawn(move || {
            if let Ok(client) = reqwest::blocking::Client::builder()
                .timeout(DELETE_TIMEOUT)
                .build()
            {
                let mut req = client.delete(&endpoint);
                for (k, v) in &extra_headers {
                    req = req.header(k.as_str(), v.as_str());
                }
                let _ = req.send();
            }
        });
    }
}

// ---------------------------------------------------------------------------
// SSE parser
// ---------------------------------------------------------------------------

/// Parse an SSE byte stream and forward every decoded `data:` payload.
///
/// Events are separated by a blank line; `\r\n` line endings are accepted.
/// Bytes are buffered until an event boundary, so multi-byte characters split
/// across chunks survive intact.
///
/// Field handling:
///
/// - `id:` -- stored in `last_event_id` for subsequent `Last-Event-ID`
///   headers.
/// - `event: ping` or `data: [PING]` -- discarded.
/// - other `data:` values -- decoded and pushed to `tx`; multi-line data is
///   joined with `\n`.
/// - `retry:` and comment lines -- ignored.
pub async fn parse_sse_stream(
    server: &str,
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    tx: mpsc::UnboundedSender<Result<JsonRpcMessage>>,
    last_event_id: Arc<RwLock<Option<String>>>,
) {
    use futures::StreamExt;

    let mut buffer: Vec<u8> = Vec::new();

    tokio::pin!(byte_stream);

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "SSE stream ended with error");
                break;
            }
        };
        buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        while let Some(pos) = find_event_boundary(&buffer) {
            let block: Vec<u8> = buffer.drain(..pos + 2).collect();
            process_sse_event(server, &block[..pos], &tx, &last_event_id);
        }
    }

    if !buffer.is_empty() {
        process_sse_event(server, &buffer, &tx, &last_event_id);
    }
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn process_sse_event(
    server: &str,
    block: &[u8],
    tx: &mpsc::UnboundedSender<Result<JsonRpcMessage>>,
    last_event_id: &RwLock<Option<String>>,
) {
    let text = String::from_utf8_lossy(block);
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<&str> = None;

    for line in text.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        } else if let Some(value) = line.strip_prefix("id:") {
            *last_event_id.write() = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        }
    }

    if event_type.is_some_and(|et| et.eq_ignore_ascii_case("ping")) {
        return;
    }

    let data = data_lines.join("\n");
    if data.is_empty() || data.eq_ignore_ascii_case("[ping]") {
        return;
    }

    let _ = tx.send(decode_frame(server, &data));
}
