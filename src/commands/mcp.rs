//! Handlers for the mcpbridge subcommands
//!
//! Every handler builds an [`McpManager`] from the loaded configuration,
//! does its work, and shuts the manager down before returning so that no
//! child process outlives the command.

use std::sync::Arc;
use std::time::{Duration, Instant};

use prettytable::{cell, row, Table};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::mcp::health::ServerHealth;
use crate::mcp::manager::{McpManager, ServerStatus};
use crate::tools::ToolExecutor;

/// A token cancelled when the user presses Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let ct = CancellationToken::new();
    let trigger = ct.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling");
            trigger.cancel();
        }
    });
    ct
}

/// Run `work` against `manager`, then shut the manager down.
///
/// The error from `work` wins over a shutdown error.
async fn with_shutdown<T>(manager: &McpManager, work: Result<T>) -> Result<T> {
    if let Err(e) = manager.shutdown().await {
        tracing::warn!(error = %format!("{:#}", e), "shutdown reported errors");
    }
    work
}

/// Parse `--args`: absent means no arguments, otherwise a JSON object.
pub fn parse_tool_args(raw: Option<&str>) -> Result<serde_json::Value> {
    let Some(raw) = raw else {
        return Ok(serde_json::Value::Null);
    };
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| BridgeError::Tool(format!("--args is not valid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(BridgeError::Tool("--args must be a JSON object".to_string()).into());
    }
    Ok(value)
}

fn health_label(health: Option<&ServerHealth>) -> String {
    match health {
        None => "-".to_string(),
        Some(h) if h.healthy => "healthy".to_string(),
        Some(h) if h.exhausted() => format!("failed ({} attempts)", h.reconnect_attempts),
        Some(h) => format!("unhealthy ({} failures)", h.consecutive_failures),
    }
}

fn print_status_table(statuses: &[ServerStatus]) {
    let mut table = Table::new();
    table.add_row(row!["Server", "Transport", "Connected", "State", "Health", "Tools"]);

    for status in statuses {
        let state = status
            .state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let connected = if status.connected { "yes" } else { "no" };
        table.add_row(row![
            status.name,
            status.transport,
            connected,
            state,
            health_label(status.health.as_ref()),
            status.tools.len()
        ]);
    }

    println!();
    table.printstd();
    println!();
}

/// Connect every auto-connect server and print their status.
///
/// Connection failures are reported but do not fail the command; the table
/// shows which servers are down.
pub async fn run_servers(config: Config, json: bool) -> Result<()> {
    let manager = McpManager::new(config.mcp);
    let ct = cancel_on_ctrl_c();

    if let Err(e) = manager.connect_all(&ct).await {
        eprintln!("warning: {:#}", e);
    }

    let statuses = manager.get_server_status().await;
    let work = if json {
        serde_json::to_string_pretty(&statuses)
            .map(|out| println!("{}", out))
            .map_err(|e| BridgeError::Serialization(e).into())
    } else {
        print_status_table(&statuses);
        Ok(())
    };
    with_shutdown(&manager, work).await
}

/// List tools from every connected server, or from one server.
pub async fn run_tools(config: Config, server: Option<String>, json: bool) -> Result<()> {
    let manager = McpManager::new(config.mcp);
    let ct = cancel_on_ctrl_c();

    let connected = match &server {
        Some(name) => manager.connect(&ct, name).await,
        None => manager.connect_all(&ct).await.or_else(|e| {
            eprintln!("warning: {:#}", e);
            Ok(())
        }),
    };
    if let Err(e) = connected {
        return with_shutdown(&manager, Err(e)).await;
    }

    let adapters: Vec<_> = manager
        .tool_adapters()
        .await
        .into_iter()
        .filter(|a| server.as_deref().map_or(true, |s| a.server() == s))
        .collect();

    let work = if json {
        let definitions: Vec<serde_json::Value> =
            adapters.iter().map(|a| a.tool_definition()).collect();
        serde_json::to_string_pretty(&definitions)
            .map(|out| println!("{}", out))
            .map_err(|e| BridgeError::Serialization(e).into())
    } else {
        let mut table = Table::new();
        table.add_row(row!["Tool", "Server", "Description"]);
        for adapter in &adapters {
            let definition = adapter.tool_definition();
            let description = definition["description"].as_str().unwrap_or_default();
            table.add_row(row![adapter.name(), adapter.server(), description]);
        }
        println!("\n{} tool(s):\n", adapters.len());
        table.printstd();
        println!();
        Ok(())
    };
    with_shutdown(&manager, work).await
}

/// Call one tool and print its text output.
///
/// # Errors
///
/// Fails if the server cannot be connected, the tool does not exist, the
/// arguments are invalid, or the tool reports an error.
pub async fn run_call(
    config: Config,
    server: String,
    tool: String,
    args: Option<String>,
) -> Result<()> {
    let arguments = parse_tool_args(args.as_deref())?;
    let manager = McpManager::new(config.mcp);
    let ct = cancel_on_ctrl_c();

    let work = call_once(&manager, &ct, &server, &tool, arguments).await;
    with_shutdown(&manager, work).await
}

async fn call_once(
    manager: &McpManager,
    ct: &CancellationToken,
    server: &str,
    tool: &str,
    arguments: serde_json::Value,
) -> Result<()> {
    manager.connect(ct, server).await?;
    let adapter = manager
        .tool_adapters()
        .await
        .into_iter()
        .find(|a| a.server() == server && a.remote_name() == tool)
        .ok_or_else(|| {
            BridgeError::Tool(format!("tool `{}` not found on server `{}`", tool, server))
        })?;

    let result = adapter.execute(ct, arguments).await?;
    if !result.success {
        return Err(BridgeError::Tool(result.error.unwrap_or_default()).into());
    }
    println!("{}", result.to_message());
    Ok(())
}

/// Connect one server and measure a ping round trip.
pub async fn run_ping(config: Config, server: String) -> Result<()> {
    let manager = McpManager::new(config.mcp);
    let ct = cancel_on_ctrl_c();

    let work = ping_once(&manager, &ct, &server).await;
    with_shutdown(&manager, work).await
}

async fn ping_once(manager: &McpManager, ct: &CancellationToken, server: &str) -> Result<()> {
    manager.connect(ct, server).await?;
    let client = manager
        .client(server)
        .await
        .ok_or_else(|| BridgeError::McpServerNotFound(server.to_string()))?;
    let started = Instant::now();
    client.ping(ct).await?;
    println!(
        "pong from {} in {} ms",
        server,
        started.elapsed().as_millis()
    );
    Ok(())
}

/// Connect all servers and run the health monitor until Ctrl-C.
pub async fn run_watch(config: Config, interval: Option<u64>) -> Result<()> {
    let interval = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.mcp.health_check_interval());
    let manager = Arc::new(McpManager::new(config.mcp));
    let ct = cancel_on_ctrl_c();

    if let Err(e) = manager.connect_all(&ct).await {
        tracing::warn!(error = %format!("{:#}", e), "some MCP servers failed to connect");
    }
    print_status_table(&manager.get_server_status().await);

    if let Err(e) = manager.start_health_monitor(interval).await {
        return with_shutdown(&manager, Err(e)).await;
    }
    tracing::info!(interval_secs = interval.as_secs(), "watching MCP servers; press Ctrl-C to stop");

    ct.cancelled().await;
    print_status_table(&manager.get_server_status().await);
    manager.shutdown().await
}
