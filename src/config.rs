//! Configuration management for mcpbridge
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{BridgeError, Result};
use crate::mcp::config::McpConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for mcpbridge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// MCP server connections
    #[serde(default)]
    pub mcp: McpConfig,
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error: defaults are used and a warning is
    /// logged.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(timeout) = std::env::var("MCPBRIDGE_REQUEST_TIMEOUT") {
            if let Ok(value) = timeout.parse() {
                self.mcp.request_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid MCPBRIDGE_REQUEST_TIMEOUT: {}", timeout);
            }
        }

        if let Ok(timeout) = std::env::var("MCPBRIDGE_CONNECT_TIMEOUT") {
            if let Ok(value) = timeout.parse() {
                self.mcp.connect_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid MCPBRIDGE_CONNECT_TIMEOUT: {}", timeout);
            }
        }

        if let Ok(interval) = std::env::var("MCPBRIDGE_HEALTH_INTERVAL") {
            if let Ok(value) = interval.parse() {
                self.mcp.health_check_interval_seconds = value;
            } else {
                tracing::warn!("Invalid MCPBRIDGE_HEALTH_INTERVAL: {}", interval);
            }
        }

        if let Ok(attempts) = std::env::var("MCPBRIDGE_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(value) = attempts.parse() {
                self.mcp.max_reconnect_attempts = value;
            } else {
                tracing::warn!("Invalid MCPBRIDGE_MAX_RECONNECT_ATTEMPTS: {}", attempts);
            }
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        self.mcp.validate()
    }
}
