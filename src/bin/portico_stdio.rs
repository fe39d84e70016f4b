//! Portico MCP server - stdio binary
//!
//! Stdout carries JSON-RPC frames; every diagnostic goes to stderr.

use anyhow::Result;
use clap::Parser;
use portico_mcp::config::Config;
use portico_mcp::server::McpServer;

#[derive(Parser)]
#[command(name = "portico-stdio", version, about = "Portico MCP server (stdio)")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable debug diagnostics on stderr
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    portico_mcp::observability::init_stderr_logging(args.debug)?;

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    let server = McpServer::builder(config).build().await?;
    eprintln!("portico-stdio v{} ready", env!("CARGO_PKG_VERSION"));
    server.stdio(args.debug).run().await
}
