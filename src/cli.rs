//! Command-line interface definition for mcpbridge
//!
//! This module defines the CLI structure using clap's derive API.

use clap::{Parser, Subcommand};

/// mcpbridge - connect to MCP tool servers and inspect or call their tools
#[derive(Parser, Debug, Clone)]
#[command(name = "mcpbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "MCPBRIDGE_CONFIG", default_value = "mcpbridge.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for mcpbridge
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Connect all auto-connect servers and print their status
    Servers {
        /// Print status as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the tools exposed by connected servers
    Tools {
        /// Only list tools from this server
        #[arg(short, long)]
        server: Option<String>,

        /// Print tool definitions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Call one tool and print its text result
    Call {
        /// Server name
        server: String,

        /// Tool name as the server advertises it
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },

    /// Connect one server and ping it
    Ping {
        /// Server name
        server: String,
    },

    /// Connect all servers and keep them healthy until Ctrl-C
    Watch {
        /// Seconds between health checks (defaults to the configured value)
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_servers() {
        let cli = Cli::try_parse_from(["mcpbridge", "servers"]).unwrap();
        assert!(matches!(cli.command, Commands::Servers { json: false }));
        assert!(!cli.verbose);
        assert!(!cli.json_logs);
    }

    #[test]
    fn test_cli_parse_tools_with_filter() {
        let cli =
            Cli::try_parse_from(["mcpbridge", "tools", "--server", "fs", "--json"]).unwrap();
        if let Commands::Tools { server, json } = cli.command {
            assert_eq!(server, Some("fs".to_string()));
            assert!(json);
        } else {
            panic!("Expected Tools command");
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let cli = Cli::try_parse_from([
            "mcpbridge",
            "call",
            "fs",
            "read_file",
            "--args",
            r#"{"path":"/tmp/x"}"#,
        ])
        .unwrap();
        if let Commands::Call { server, tool, args } = cli.command {
            assert_eq!(server, "fs");
            assert_eq!(tool, "read_file");
            assert_eq!(args.as_deref(), Some(r#"{"path":"/tmp/x"}"#));
        } else {
            panic!("Expected Call command");
        }
    }

    #[test]
    fn test_cli_parse_call_requires_tool() {
        assert!(Cli::try_parse_from(["mcpbridge", "call", "fs"]).is_err());
    }

    #[test]
    fn test_cli_parse_watch_interval() {
        let cli = Cli::try_parse_from(["mcpbridge", "watch", "--interval", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Watch { interval: Some(5) }));
    }

    #[test]
    fn test_cli_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "mcpbridge",
            "-v",
            "--json-logs",
            "-c",
            "other.yaml",
            "ping",
            "fs",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(cli.json_logs);
        assert_eq!(cli.config.as_deref(), Some("other.yaml"));
    }

    #[test]
    fn test_cli_parse_missing_command() {
        assert!(Cli::try_parse_from(["mcpbridge"]).is_err());
    }

    #[test]
    fn test_cli_parse_invalid_command() {
        assert!(Cli::try_parse_from(["mcpbridge", "invalid"]).is_err());
    }
}
