//! Portico MCP server - Streamable HTTP binary

use anyhow::Result;
use clap::Parser;
use portico_mcp::config::Config;
use portico_mcp::server::McpServer;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "portico-http", version, about = "Portico MCP server (Streamable HTTP)")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen host override
    #[arg(long, env = "PORTICO_HOST")]
    host: Option<String>,

    /// Listen port override
    #[arg(long, env = "PORTICO_PORT")]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    portico_mcp::observability::init_logging_with_level(args.verbose, args.quiet)?;

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let server = Arc::new(McpServer::builder(config).build().await?);
    let handle = server.serve().await?;
    tracing::info!("portico-http ready on {}", handle.local_addr);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    handle.close().await;
    Ok(())
}
