// ABOUTME: Tracing subscriber setup for applications embedding the engine
// ABOUTME: Honours RUST_LOG first, then the configured level, in pretty or compact format

use anyhow::{anyhow, Result};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a global `tracing` subscriber. Returns an error if one is
/// already installed.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let log_level = if verbose { "debug" } else { &config.level };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let installed = match config.format.as_str() {
        "compact" => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init(),
    };
    installed.map_err(|e| anyhow!("Failed to initialise logging: {}", e))?;

    debug!("Logging initialized with level: {}", log_level);
    Ok(())
}
