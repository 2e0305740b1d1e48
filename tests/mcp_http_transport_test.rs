//! MCP HTTP transport integration tests
//!
//! Drives `HttpTransport` against a `wiremock` mock server.
//!
//! # wiremock body helpers
//!
//! Use `set_body_raw(bytes, mime)` for SSE responses so that the
//! `Content-Type` is set to `text/event-stream` exactly.  `set_body_string`
//! forces `text/plain` and `set_body_json` forces `application/json`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use mcpbridge::error::BridgeError;
use mcpbridge::mcp::client::JsonRpcClient;
use mcpbridge::mcp::protocol::{ClientState, McpClient};
use mcpbridge::mcp::transport::{HttpTransport, Transport};
use mcpbridge::mcp::types::{JsonRpcMessage, RequestId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_transport(base_url: &str, headers: HashMap<String, String>) -> HttpTransport {
    HttpTransport::new(
        "remote",
        url::Url::parse(base_url).expect("valid url"),
        headers,
        Duration::from_secs(5),
    )
    .expect("build transport")
}

fn request(id: u64, method: &str) -> JsonRpcMessage {
    JsonRpcMessage::request(RequestId::Number(id), method, Some(json!({})))
}

/// Collect messages from `receive()` until `deadline` passes with nothing new.
async fn drain_receive(transport: &HttpTransport, deadline: Duration) -> Vec<JsonRpcMessage> {
    let mut messages = Vec::new();
    while let Ok(Ok(Some(msg))) = tokio::time::timeout(deadline, transport.receive()).await {
        messages.push(msg);
    }
    messages
}

/// A minimal MCP server answering by method name.
struct RpcResponder;

impl Respond for RpcResponder {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        let body: Value = match serde_json::from_slice(&req.body) {
            Ok(v) => v,
            Err(_) => return ResponseTemplate::new(400),
        };
        let Some(id) = body.get("id").cloned() else {
            return ResponseTemplate::new(202);
        };
        let result = match body["method"].as_str().unwrap_or("") {
            "initialize" => json!({
                "protocolVersion": "2025-11-25",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "wiremock-mcp", "version": "1.0.0"}
            }),
            "tools/list" => json!({
                "tools": [{"name": "lookup", "inputSchema": {"type": "object"}}]
            }),
            "tools/call" => json!({
                "content": [{"type": "text", "text": "found it"}]
            }),
            _ => json!({}),
        };
        ResponseTemplate::new(200)
            .insert_header("MCP-Session-Id", "sess-rpc")
            .set_body_json(json!({"jsonrpc": "2.0", "id": id, "result": result}))
    }
}

// ---------------------------------------------------------------------------
// Response bodies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_json_response_forwarded_to_receive() {
    let server = MockServer::start().await;
    let body = r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "application/json"),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri(), HashMap::new());
    transport.send(&request(1, "tools/list")).await.unwrap();

    let messages = drain_receive(&transport, Duration::from_millis(200)).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id(), Some(&RequestId::Number(1)));
}

#[tokio::test]
async fn test_sse_response_forwards_every_event() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n",
        "\n",
        "id: evt-1\n",
        "data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"done\":true}}\n",
        "\n",
    );
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri(), HashMap::new());
    transport.send(&request(7, "tools/call")).await.unwrap();

    let messages = drain_receive(&transport, Duration::from_millis(300)).await;
    assert_eq!(messages.len(), 2);
    assert!(messages[0].is_notification());
    assert_eq!(messages[1].id(), Some(&RequestId::Number(7)));
}

#[tokio::test]
async fn test_accepted_produces_no_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri(), HashMap::new());
    transport
        .send(&JsonRpcMessage::notification("notifications/initialized", None))
        .await
        .unwrap();

    assert!(drain_receive(&transport, Duration::from_millis(100))
        .await
        .is_empty());
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unauthorized_is_a_transport_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer realm=\"mcp\""),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri(), HashMap::new());
    let err = transport.send(&request(1, "ping")).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("401"));
    assert!(message.contains("Bearer"));
}

#[tokio::test]
async fn test_server_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri(), HashMap::new());
    let err = transport.send(&request(1, "ping")).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BridgeError>(),
        Some(BridgeError::McpTransport(msg)) if msg.contains("503")
    ));
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_send() {
    // Port 9 (discard) is closed on test machines.
    let transport = make_transport("http://127.0.0.1:9/mcp", HashMap::new());
    let err = transport.send(&request(1, "ping")).await.unwrap_err();
    assert!(err.to_string().contains("HTTP POST"));
}

// ---------------------------------------------------------------------------
// Headers and sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_configured_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("Authorization", "Bearer test-token"))
        .and(header("MCP-Protocol-Version", "2025-11-25"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let headers = HashMap::from([(
        "Authorization".to_string(),
        "Bearer test-token".to_string(),
    )]);
    let transport = make_transport(&server.uri(), headers);
    transport.send(&request(1, "ping")).await.unwrap();
    server.verify().await;
}

#[tokio::test]
async fn test_session_id_is_echoed_and_deleted_on_close() {
    let server = MockServer::start().await;

    // Mounted first so it wins once the session header is present.
    Mock::given(method("POST"))
        .and(header("MCP-Session-Id", "sess-1"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("MCP-Session-Id", "sess-1")
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(header("MCP-Session-Id", "sess-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri(), HashMap::new());
    transport.send(&request(1, "initialize")).await.unwrap();
    assert_eq!(transport.session_id().as_deref(), Some("sess-1"));

    transport
        .send(&JsonRpcMessage::notification("notifications/initialized", None))
        .await
        .unwrap();

    transport.close().await.unwrap();
    assert!(transport.session_id().is_none());
    server.verify().await;
}

#[tokio::test]
async fn test_not_found_with_session_expires_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("MCP-Session-Id", "sess-old"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("MCP-Session-Id", "sess-old")
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri(), HashMap::new());
    transport.send(&request(1, "initialize")).await.unwrap();
    let err = transport.send(&request(2, "ping")).await.unwrap_err();
    assert!(err.to_string().contains("expired"));
    assert!(transport.session_id().is_none());
}

// ---------------------------------------------------------------------------
// Full client over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_client_handshake_and_call_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(RpcResponder)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let transport = Arc::new(make_transport(&server.uri(), HashMap::new()));
    let client = McpClient::new("remote", transport);
    let ct = CancellationToken::new();

    client.initialize(&ct).await.unwrap();
    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(client.server_info().unwrap().name, "wiremock-mcp");

    let tools = client.list_tools(&ct).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "lookup");

    let response = client
        .call_tool(&ct, "lookup", Some(json!({"q": "x"})))
        .await
        .unwrap();
    assert!(!response.is_error());

    client.close().await.unwrap();
    assert_eq!(client.state(), ClientState::Closed);
}

#[tokio::test]
async fn test_client_request_fails_when_post_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let transport = Arc::new(make_transport(&server.uri(), HashMap::new()));
    let client = McpClient::new("remote", transport);
    let err = client
        .initialize(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"));
    assert_eq!(client.state(), ClientState::Failed);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_cancel_unblocks_request_while_post_is_in_flight() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}}))
                .set_delay(Duration::from_secs(4)),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri(), HashMap::new());
    let client = Arc::new(JsonRpcClient::new("remote", Arc::new(transport)));
    let ct = CancellationToken::new();

    let started = tokio::time::Instant::now();
    let call = tokio::spawn({
        let client = Arc::clone(&client);
        let ct = ct.clone();
        async move {
            client
                .request::<_, Value>(&ct, "tools/call", json!({}), Some(Duration::from_secs(30)))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    ct.cancel();

    let err = call.await.unwrap().unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(matches!(
        err.downcast_ref::<BridgeError>(),
        Some(BridgeError::McpCancelled { .. })
    ));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_timeout_bounds_a_slow_post() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}}))
                .set_delay(Duration::from_secs(4)),
        )
        .mount(&server)
        .await;

    let transport = make_transport(&server.uri(), HashMap::new());
    let client = JsonRpcClient::new("remote", Arc::new(transport));

    let started = tokio::time::Instant::now();
    let err = client
        .request::<_, Value>(
            &CancellationToken::new(),
            "tools/list",
            json!({}),
            Some(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(matches!(
        err.downcast_ref::<BridgeError>(),
        Some(BridgeError::McpTimeout { .. })
    ));
}
