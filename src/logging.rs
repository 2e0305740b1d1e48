//! Logging setup for the mcpbridge binary
//!
//! Installs a `tracing` subscriber writing to stderr, so that stdout stays
//! free for command output. `RUST_LOG` wins over the built-in default.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive for a verbosity level.
///
/// # Examples
///
/// ```
/// use mcpbridge::logging::default_directive;
///
/// assert_eq!(default_directive(false), "mcpbridge=info");
/// assert_eq!(default_directive(true), "mcpbridge=debug");
/// ```
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "mcpbridge=debug"
    } else {
        "mcpbridge=info"
    }
}

/// Initialize the global subscriber.
///
/// # Arguments
///
/// * `verbose` - Raise the default level to debug
/// * `json` - Emit one JSON object per event instead of human-readable lines
///
/// # Errors
///
/// Returns an error if the filter directive cannot be parsed or a global
/// subscriber is already installed.
pub fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(verbose)))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    Ok(())
}
