//! SQL-injection testing proxy: an intercepting HTTP/HTTPS MITM proxy with
//! a companion inspection API.
//!
//! ## Usage
//!
//! ```bash
//! sqli-proxy proxy --config proxy.toml
//! sqli-proxy api --config proxy.toml
//! ```
//!
//! `proxy` runs the intercepting listener (CONNECT tunneling + plain-proxy
//! forwarding), capturing every request/response pair into the configured
//! SQLite database. `api` runs the inspection facade over the same
//! database, exposing replay and differential-scan endpoints.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqli_proxy::config::AppConfig;
use sqli_proxy::{ApiServer, ProxyServer, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sqli-proxy")]
#[command(about = "Intercepting HTTP/HTTPS proxy with an SQL-injection inspection API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the intercepting proxy listener
    Proxy {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Proxy listen port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run the inspection API facade
    Api {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// API listen port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            match cli.command {
                Commands::Proxy { config, port } => run_proxy(config, port).await,
                Commands::Api { config, port } => run_api(config, port).await,
            }
        })
}

fn load_config(config_path: Option<PathBuf>) -> AppConfig {
    match config_path {
        Some(path) => AppConfig::from_file(&path).unwrap_or_else(|e| {
            eprintln!("failed to load config from {}: {e:#}", path.display());
            std::process::exit(1);
        }),
        None => AppConfig::from_env(),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

async fn run_proxy(config_path: Option<PathBuf>, port: Option<u16>) -> Result<()> {
    init_tracing();

    let mut config = load_config(config_path);
    if let Some(p) = port {
        config.proxy_port = p;
    }
    let config = Arc::new(config);

    let store = Arc::new(Store::open(&config.db).context("failed to open store")?);

    tracing::info!(app_name = %config.app_name, "starting proxy listener");
    let proxy = ProxyServer::new(config, store)?;
    proxy.run().await
}

async fn run_api(config_path: Option<PathBuf>, port: Option<u16>) -> Result<()> {
    init_tracing();

    let mut config = load_config(config_path);
    if let Some(p) = port {
        config.api_port = p;
    }
    let config = Arc::new(config);

    let store = Arc::new(Store::open(&config.db).context("failed to open store")?);

    tracing::info!(app_name = %config.app_name, "starting inspection API");
    let api = ApiServer::new(config, store);
    api.run().await
}
