//! # Pane MCP Server
//!
//! Model Context Protocol server that runs commands inside live terminal
//! multiplexer panes and returns only each command's output.
//!
//! ## Overview
//!
//! This server provides MCP tools for:
//! - Command execution with output isolation
//! - Raw input (send text, press keys, clear screen)
//! - Screen reads with scrollback
//! - Pane management (list, inspect, new tab, split)
//! - Connection pool diagnostics and cleanup
//!
//! ## Usage
//!
//! ```text
//! pane-mcp [--config <path>] [--host <tmux|memory>]
//! ```
//!
//! Logs go to stderr; stdout carries the MCP protocol.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use pane_mcp::PaneMcpServer;
use pane_mcp_core::{HostBackend, ServerConfig};
use pane_mcp_exec::CommandExecutor;
use pane_mcp_host::{MemoryHost, TerminalHost, TmuxHost};
use rmcp::{transport::stdio, ServiceExt};

/// Command line options.
#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    config: Option<PathBuf>,
    host: Option<HostBackend>,
    help: bool,
}

const USAGE: &str = "Usage: pane-mcp [--config <path>] [--host <tmux|memory>]";

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--host" => {
                let host = args.next().context("--host needs tmux or memory")?;
                parsed.host = Some(host.parse()?);
            }
            "--help" | "-h" => parsed.help = true,
            other => bail!("unknown argument `{other}`\n{USAGE}"),
        }
    }
    Ok(parsed)
}

fn load_config(args: &CliArgs) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ServerConfig::default(),
    };
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    if let Some(host) = args.host {
        config.host.backend = host;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }
    let config = load_config(&args)?;

    // Initialize logging; stdout is reserved for the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.server.log_level)),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!(
        "Pane MCP Server v{} starting with {} host...",
        env!("CARGO_PKG_VERSION"),
        config.host.backend
    );

    let host: Arc<dyn TerminalHost> = match config.host.backend {
        HostBackend::Tmux => Arc::new(TmuxHost::new(&config.host)),
        HostBackend::Memory => Arc::new(MemoryHost::with_scrollback(config.host.scrollback_lines)),
    };
    let executor = Arc::new(CommandExecutor::new(host, &config));
    let server = PaneMcpServer::new(Arc::clone(&executor));

    tracing::info!("Server initialized, starting stdio transport...");

    // Serve the MCP server over stdio
    let service = server.serve(stdio()).await.map_err(|e| {
        tracing::error!("Error starting server: {}", e);
        e
    })?;

    tracing::info!("Pane MCP Server running on stdio");

    // Wait for the client to disconnect or for Ctrl+C
    tokio::select! {
        result = service.waiting() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    let closed = executor.shutdown().await;
    tracing::info!(
        "Pane MCP Server shutting down ({} connection(s) closed)",
        closed
    );

    Ok(())
}
