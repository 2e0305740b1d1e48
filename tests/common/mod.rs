use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

use mcpbridge::mcp::config::McpServerConfig;

/// Path to the `mcp_test_server` helper binary.
///
/// Cargo sets `CARGO_BIN_EXE_mcp_test_server` for integration tests of the
/// same package.
#[allow(dead_code)]
pub fn test_server_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mcp_test_server"))
}

/// A stdio server entry running the helper binary.
#[allow(dead_code)]
pub fn test_server_config(name: &str) -> McpServerConfig {
    McpServerConfig::stdio(name, test_server_exe().to_string_lossy().to_string())
        .with_retry_delay_seconds(0)
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("mcpbridge.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
