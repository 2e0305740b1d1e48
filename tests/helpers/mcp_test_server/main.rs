//! MCP test server binary for integration tests
//!
//! A minimal MCP server speaking newline-delimited JSON over stdin/stdout.
//! Integration tests spawn it through the real `StdioTransport`.
//!
//! # Handled Methods
//!
//! - `initialize` -- protocol version `2025-11-25` (or `--protocol-version`),
//!   capabilities `tools`, `resources`, `prompts`; with `--fail-initialize`
//!   answers with a `-32603` error instead.
//! - `notifications/*` -- swallowed.
//! - `tools/list` -- `echo`, `fail`, `env`, `sleep`, `crash`.
//! - `tools/call`:
//!   - `echo` returns `arguments.message`;
//!   - `fail` returns an `isError: true` result;
//!   - `env` returns the process environment as sorted `KEY=VALUE` lines;
//!   - `sleep` waits `arguments.ms` milliseconds before answering;
//!   - `crash` exits the process without answering.
//! - `resources/list` -- two pages of one resource each.
//! - `resources/read` -- text contents for `mem://greeting`.
//! - `prompts/list` -- one prompt.
//! - `ping` -- empty result.
//! - anything else -- `-32601 Method not found`.
//!
//! Every stdin line is logged to stderr, which exercises the transport's
//! stderr drain.

use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

struct Options {
    fail_initialize: bool,
    protocol_version: String,
}

fn parse_options() -> Options {
    let mut options = Options {
        fail_initialize: false,
        protocol_version: "2025-11-25".to_string(),
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fail-initialize" => options.fail_initialize = true,
            "--protocol-version" => {
                if let Some(v) = args.next() {
                    options.protocol_version = v;
                }
            }
            other => eprintln!("mcp_test_server: ignoring argument {}", other),
        }
    }
    options
}

fn main() {
    let options = parse_options();
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        eprintln!("mcp_test_server <- {}", trimmed);

        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                let response = make_error(&Value::Null, -32700, "Parse error");
                if !write_line(&mut out, &response) {
                    break;
                }
                continue;
            }
        };

        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let Some(id) = request.get("id").cloned() else {
            // Notification or stray response: nothing to answer.
            continue;
        };
        if method.is_empty() {
            continue;
        }

        let response = match method {
            "initialize" => handle_initialize(&id, &options),
            "tools/list" => handle_tools_list(&id),
            "tools/call" => handle_tools_call(&id, &request),
            "resources/list" => handle_resources_list(&id, &request),
            "resources/read" => handle_resources_read(&id, &request),
            "prompts/list" => handle_prompts_list(&id),
            "ping" => ok(&id, json!({})),
            _ => make_error(&id, -32601, &format!("Method not found: {}", method)),
        };

        if !write_line(&mut out, &response) {
            break;
        }
    }
}

fn write_line(out: &mut impl Write, value: &Value) -> bool {
    let serialized = match serde_json::to_string(value) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("mcp_test_server: failed to serialize response: {}", e);
            return true;
        }
    };
    writeln!(out, "{}", serialized).is_ok() && out.flush().is_ok()
}

fn ok(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn handle_initialize(id: &Value, options: &Options) -> Value {
    if options.fail_initialize {
        return make_error(id, -32603, "initialize refused by test server");
    }
    ok(
        id,
        json!({
            "protocolVersion": options.protocol_version,
            "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
            "serverInfo": {"name": "mcp-test-server", "version": "0.1.0"},
            "instructions": "Test server for mcpbridge integration tests"
        }),
    )
}

fn handle_tools_list(id: &Value) -> Value {
    ok(
        id,
        json!({
            "tools": [
                {
                    "name": "echo",
                    "description": "Echoes input",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"message": {"type": "string"}},
                        "required": ["message"]
                    }
                },
                {"name": "fail", "inputSchema": {"type": "object"}},
                {
                    "name": "env",
                    "description": "Dumps the server environment",
                    "inputSchema": {"type": "object"}
                },
                {
                    "name": "sleep",
                    "description": "Waits before answering",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"ms": {"type": "integer"}}
                    }
                },
                {
                    "name": "crash",
                    "description": "Exits without answering",
                    "inputSchema": {"type": "object"}
                }
            ]
        }),
    )
}

fn text_result(id: &Value, text: &str, is_error: bool) -> Value {
    ok(
        id,
        json!({
            "content": [{"type": "text", "text": text}],
            "isError": is_error
        }),
    )
}

fn handle_tools_call(id: &Value, request: &Value) -> Value {
    let params = request.get("params").unwrap_or(&Value::Null);
    let tool_name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
    let arguments = params.get("arguments").unwrap_or(&Value::Null);

    match tool_name {
        "echo" => {
            let message = arguments
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("");
            text_result(id, message, false)
        }
        "fail" => text_result(id, "intentional failure", true),
        "env" => {
            let mut vars: Vec<String> = std::env::vars()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            vars.sort();
            text_result(id, &vars.join("\n"), false)
        }
        "sleep" => {
            let ms = arguments.get("ms").and_then(|m| m.as_u64()).unwrap_or(0);
            std::thread::sleep(std::time::Duration::from_millis(ms));
            text_result(id, &format!("slept {} ms", ms), false)
        }
        "crash" => std::process::exit(3),
        other => make_error(id, -32602, &format!("Unknown tool: {}", other)),
    }
}

fn handle_resources_list(id: &Value, request: &Value) -> Value {
    let cursor = request
        .get("params")
        .and_then(|p| p.get("cursor"))
        .and_then(|c| c.as_str());
    match cursor {
        None => ok(
            id,
            json!({
                "resources": [{"uri": "mem://greeting", "name": "greeting", "mimeType": "text/plain"}],
                "nextCursor": "page-2"
            }),
        ),
        Some(_) => ok(
            id,
            json!({
                "resources": [{"uri": "mem://logo", "name": "logo", "mimeType": "image/png"}]
            }),
        ),
    }
}

fn handle_resources_read(id: &Value, request: &Value) -> Value {
    let uri = request
        .get("params")
        .and_then(|p| p.get("uri"))
        .and_then(|u| u.as_str())
        .unwrap_or("");
    match uri {
        "mem://greeting" => ok(
            id,
            json!({"contents": [{"uri": uri, "mimeType": "text/plain", "text": "hello"}]}),
        ),
        "mem://logo" => ok(
            id,
            json!({"contents": [{"uri": uri, "mimeType": "image/png", "blob": "iVBORw0KGgo="}]}),
        ),
        _ => make_error(id, -32602, &format!("Unknown resource: {}", uri)),
    }
}

fn handle_prompts_list(id: &Value) -> Value {
    ok(
        id,
        json!({
            "prompts": [{
                "name": "summarize",
                "description": "Summarize a document",
                "arguments": [{"name": "uri", "required": true}]
            }]
        }),
    )
}

fn make_error(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    })
}
