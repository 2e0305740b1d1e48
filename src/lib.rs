//! mcpbridge - supervised MCP client library
//!
//! This library connects to external tool servers over the Model Context
//! Protocol, keeps those connections healthy, and exposes remote tools to an
//! agent through a generic tool interface.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `mcp`: message model, transports, client, manager and tool adapter
//! - `tools`: the `ToolExecutor` trait, tool registry and results
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`, `commands`, `logging`: the command-line front end
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcpbridge::mcp::McpManager;
//! use mcpbridge::tools::ToolRegistry;
//! use mcpbridge::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config: Config = serde_yaml::from_str(&std::fs::read_to_string("mcpbridge.yaml")?)?;
//!     config.validate()?;
//!
//!     let manager = Arc::new(McpManager::new(config.mcp.clone()));
//!     manager.connect_all(&CancellationToken::new()).await?;
//!     manager.start_health_monitor(config.mcp.health_check_interval()).await?;
//!
//!     let mut registry = ToolRegistry::new();
//!     manager.register_tools(&mut registry).await;
//!     println!("{} tools available", registry.len());
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod mcp;
pub mod tools;

// Re-export commonly used types
pub use config::Config;
pub use error::{BridgeError, Result};
