//! Logging setup built on tracing.

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize logging with default verbosity.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let env_filter = filter_for(verbose, quiet);
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;
    Ok(())
}

/// Logging for the stdio transport: stdout carries protocol frames, so all
/// diagnostics go to stderr.
pub fn init_stderr_logging(verbose: bool) -> Result<()> {
    let env_filter = filter_for(verbose, false);
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;
    Ok(())
}

fn filter_for(verbose: bool, quiet: bool) -> EnvFilter {
    // Quiet always wins, including over RUST_LOG.
    if quiet {
        return EnvFilter::new("error");
    }
    let fallback = if verbose {
        EnvFilter::new("portico_mcp=debug,info")
    } else {
        EnvFilter::new("portico_mcp=info,warn")
    };
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(fallback)
    } else {
        fallback
    }
}
