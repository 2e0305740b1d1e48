/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint.

- `mcp`: server status, tool listing, one-off calls, ping and watch

These handlers are small and use the library components:
the MCP manager, its tool adapters, and the configuration.
*/

pub mod mcp;

use crate::cli::Commands;
use crate::config::Config;
use crate::error::Result;

/// Dispatch a parsed command to its handler
///
/// # Errors
///
/// Returns whatever the selected handler returns.
pub async fn dispatch(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Servers { json } => mcp::run_servers(config, json).await,
        Commands::Tools { server, json } => mcp::run_tools(config, server, json).await,
        Commands::Call { server, tool, args } => mcp::run_call(config, server, tool, args).await,
        Commands::Ping { server } => mcp::run_ping(config, server).await,
        Commands::Watch { interval } => mcp::run_watch(config, interval).await,
    }
}
