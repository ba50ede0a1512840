use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};

use shoal_core::paths::ShoalPaths;
use shoal_core::logging::init_logging;
use shoal_network::{CoordinatorConfig, CoordinatorServer, CredentialFile};

/// Shoal coordination service.
#[derive(Parser, Debug)]
#[command(name = "shoal-coordinator", author, version, about)]
struct Args {
    /// UDP port to listen on.
    port: u16,

    /// Address to bind. Defaults to the configured listen address.
    #[arg(long)]
    host: Option<IpAddr>,

    /// Credential file with one `username password` pair per line.
    #[arg(long, default_value = "credentials.txt")]
    credentials: PathBuf,

    /// Config file. Defaults to ~/.shoal/coordinator.json.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    ShoalPaths::ensure_dirs()?;
    let _log_guard = init_logging(&ShoalPaths::logs_dir()?, "shoal-coordinator.log", "info", true)?;

    let config_path = match args.config {
        Some(path) => path,
        None => ShoalPaths::coordinator_config_path()?,
    };
    let mut config = CoordinatorConfig::load_or_default(&config_path);
    if !config_path.exists() {
        if let Err(e) = config.save_to_file(&config_path) {
            warn!("Could not write default config to {}: {e}", config_path.display());
        }
    }
    config.listen_addr.set_port(args.port);
    if let Some(host) = args.host {
        config.listen_addr.set_ip(host);
    }

    let credentials = CredentialFile::load(&args.credentials).with_context(|| {
        format!("Failed to load credentials from {}", args.credentials.display())
    })?;
    info!("Loaded {} account(s)", credentials.len());
    let mut accounts: Vec<&str> = credentials.usernames().collect();
    accounts.sort_unstable();
    debug!("Accounts: {}", accounts.join(", "));

    let mut server = CoordinatorServer::new(config, Arc::new(credentials));
    let addr = server.start().await.context("Failed to start coordinator")?;
    info!("Shoal coordinator listening on {addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    server.stop().await;
    Ok(())
}
