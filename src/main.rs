//! mcpbridge - MCP client CLI
//!
#![doc = "mcpbridge - MCP client CLI"]
#![doc = "Main entry point for the mcpbridge application."]

use anyhow::Result;

use mcpbridge::cli::Cli;
use mcpbridge::commands;
use mcpbridge::config::Config;
use mcpbridge::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_logging(cli.verbose, cli.json_logs)?;

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("mcpbridge.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    tracing::debug!(servers = config.mcp.servers.len(), "configuration loaded");
    commands::dispatch(cli.command, config).await
}
