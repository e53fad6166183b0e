//! WAGI CLI entry point.
//!
//! Loads the configuration, builds the initial route table and runs the
//! HTTP server.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use wagi_common::ConfigFile;
use wagi_server::{ConfigSource, ServerConfig, WagiServer};

/// Run WebAssembly modules as CGI-style HTTP handlers.
#[derive(Parser, Debug)]
#[command(name = "wagi", version, about)]
struct Cli {
    /// Configuration file (TOML, or JSON by extension).
    #[arg(short, long, env = "WAGI_CONFIG")]
    config: Option<PathBuf>,

    /// Legacy modules.toml; replaces the `[wagi]` section of `--config`.
    #[arg(long)]
    modules_toml: Option<PathBuf>,

    /// Address to listen on, overriding the configuration file.
    #[arg(short, long, env = "BIND_ADDR")]
    listen: Option<SocketAddr>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,wagi=debug".into());
    let json = format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting WAGI");

    let mut file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => ConfigFile::default(),
    };

    if let Some(path) = &cli.modules_toml {
        file.wagi = wagi_common::WagiConfig::from_modules_toml_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?;
    }

    file.wagi
        .validate()
        .context("Invalid module configuration")?;
    if file.wagi.is_empty() {
        warn!("No modules or bindles configured; every request will get 404");
    }

    let mut server_config = ServerConfig::from_file(&file.server)?;
    if let Some(addr) = cli.listen {
        server_config = server_config.with_bind_addr(addr);
    }
    if file.server.watch_config {
        let source = match (&cli.modules_toml, &cli.config) {
            (Some(path), _) => Some(ConfigSource::ModulesToml(path.clone())),
            (None, Some(path)) => Some(ConfigSource::File(path.clone())),
            (None, None) => None,
        };
        if let Some(source) = source {
            server_config = server_config.with_watch(source);
        }
    }

    info!(bind_addr = %server_config.bind_addr, "Configuration loaded");

    let server = WagiServer::new(&file.runtime, &file.wagi, server_config)?;
    let routes = server.state().rebuild(file.wagi).await?;

    info!(routes, "Server initialized");
    for entry in server.state().routes().entries() {
        info!(
            route = %entry.pattern(),
            module = %entry.module().path.display(),
            entrypoint = %entry.module().entrypoint,
            "Serving"
        );
    }

    server.run().await?;

    Ok(())
}
