//! tool-filter-proxy: MCP proxy that restricts which upstream tools are
//! visible and callable.
//!
//! Sits between an MCP client and one upstream MCP server, filtering the
//! tool list by regex over tool names:
//!
//!   # Hide file-writing tools from an HTTP upstream
//!   tool-filter-proxy --upstream https://example.com/mcp --deny '.*_file$'
//!
//!   # Expose only two tools from a subprocess upstream
//!   tool-filter-proxy --allow 'read_file,list_dir' --upstream-stdio -- uvx some-mcp-server
//!
//!   # Inspect the filtered tool list without serving
//!   tool-filter-proxy --upstream https://example.com/mcp --deny '.*_file$' --list-tools
//!
//! The downstream side is served over stdio; logs go to stderr so stdout
//! stays clean for the protocol.

mod envvars;
mod format;
mod headers;

use anyhow::{bail, Context, Result};
use clap::Parser;
use format::{format_command_display, format_tools_list, OutputFormat};
use mcp_filter::{FilterMode, ProxyConfig, ProxyServer, ToolFilterProxy};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tool-filter-proxy")]
#[command(about = "MCP proxy that filters which upstream tools are exposed")]
#[command(version)]
struct Cli {
    /// Upstream MCP server URL (streamable HTTP or legacy SSE)
    #[arg(long, value_name = "URL")]
    upstream: Option<String>,

    /// Spawn the upstream MCP server as a subprocess; the command follows `--`
    #[arg(long)]
    upstream_stdio: bool,

    /// Upstream command and arguments (after `--`, with --upstream-stdio)
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,

    /// Hide tools whose names match these regex patterns (comma-separated)
    #[arg(long, value_delimiter = ',', value_name = "PATTERNS", conflicts_with = "allow")]
    deny: Vec<String>,

    /// Expose only tools whose names match these regex patterns (comma-separated)
    #[arg(long, value_delimiter = ',', value_name = "PATTERNS")]
    allow: Vec<String>,

    /// Extra HTTP header for the upstream, as 'Name: Value' (repeatable)
    #[arg(long, value_name = "HEADER")]
    header: Vec<String>,

    /// Environment variable for the upstream subprocess, as 'KEY=value' (repeatable)
    #[arg(long, value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Print the filtered tool list and exit instead of serving
    #[arg(long)]
    list_tools: bool,

    /// Output format for --list-tools
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Result<(ProxyConfig, bool, OutputFormat)> {
        let (patterns, mode) = if !self.allow.is_empty() {
            (self.allow.clone(), FilterMode::Allow)
        } else {
            (self.deny.clone(), FilterMode::Deny)
        };

        let config = match (&self.upstream, self.upstream_stdio) {
            (Some(_), true) => {
                bail!("--upstream and --upstream-stdio are mutually exclusive")
            }
            (None, false) => {
                bail!("one of --upstream <URL> or --upstream-stdio -- <command> is required")
            }
            (Some(url), false) => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    bail!("--upstream must be an http:// or https:// URL, got '{}'", url);
                }
                if !self.command.is_empty() {
                    bail!("a trailing command requires --upstream-stdio");
                }
                if !self.env.is_empty() {
                    warn!("--env only applies to stdio upstreams, ignoring");
                }
                let headers = headers::parse_headers(&self.header)?;
                ProxyConfig::http(url)
                    .with_patterns(patterns, mode)
                    .with_headers(headers)
            }
            (None, true) => {
                let (command, args) = self
                    .command
                    .split_first()
                    .context("--upstream-stdio requires a command after '--'")?;
                if !self.header.is_empty() {
                    warn!("--header only applies to HTTP upstreams, ignoring");
                }
                let env = envvars::parse_env_vars(&self.env)?;
                info!(
                    command = %format_command_display(command, args),
                    "upstream subprocess configured"
                );
                ProxyConfig::stdio(command, args.to_vec())
                    .with_patterns(patterns, mode)
                    .with_env(env)
            }
        };

        Ok((config, self.list_tools, self.format))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for the stdio transport.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let (config, list_tools, output_format) = cli.into_config()?;

    info!(upstream = %config.identifier(), "starting tool-filter-proxy");
    let proxy = Arc::new(ToolFilterProxy::new(config)?);

    if let Err(e) = proxy.start().await {
        proxy.shutdown().await;
        return Err(e.into());
    }

    if list_tools {
        let tools = proxy.tools().await?;
        println!("{}", format_tools_list(&tools, output_format)?);
        proxy.shutdown().await;
        return Ok(());
    }

    let server = ProxyServer::new(Arc::clone(&proxy));
    tokio::select! {
        result = server.serve_stdio() => {
            result?;
            info!("downstream client disconnected");
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    proxy.shutdown().await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
