use std::sync::Arc;

use clap::Parser;
use mcp_hub::{Hub, HubConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// MCP Aggregating Hub — discovers, routes to, and supervises many MCP
/// backends behind one endpoint.
#[derive(Parser, Debug)]
#[command(name = "mcp-hub", version, about)]
struct Cli {
    /// Path to a TOML configuration file. Without one the hub starts with
    /// no configured backends and answers `tools/list` with an empty set.
    #[arg(long, env = "MCP_HUB_CONFIG")]
    config: Option<String>,

    /// Host to bind the HTTP server to, overriding the config file.
    #[arg(long, env = "MCP_HUB_HOST")]
    host: Option<String>,

    /// Port to bind the HTTP server to, overriding the config file.
    #[arg(long, env = "MCP_HUB_PORT")]
    port: Option<u16>,

    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = Registry::default().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => HubConfig::from_file(path)?,
        None => HubConfig::default(),
    };
    if let Some(host) = cli.host {
        config.http.host = host;
    }
    if let Some(port) = cli.port {
        config.http.port = port;
    }

    let hub = Arc::new(Hub::new(config).await?);
    hub.serve().await
}
