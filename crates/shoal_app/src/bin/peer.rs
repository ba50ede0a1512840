use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use shoal_app::cli::{self, Console};
use shoal_core::logging::init_logging;
use shoal_core::paths::ShoalPaths;
use shoal_network::{LocalDirectory, NetworkError, PeerAgent, PeerConfig};

/// Shoal peer: share files and fetch them from other peers.
#[derive(Parser, Debug)]
#[command(name = "shoal-peer", author, version, about)]
struct Args {
    /// UDP port of the coordination service.
    server_port: u16,

    /// Host of the coordination service.
    #[arg(long, default_value = "127.0.0.1")]
    server_host: IpAddr,

    /// Log in as this user instead of prompting.
    #[arg(long)]
    username: Option<String>,

    /// Parent of the per-user shared directories.
    #[arg(long, default_value = ".")]
    shared_root: PathBuf,

    /// Config file. Defaults to ~/.shoal/peer.json.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    ShoalPaths::ensure_dirs()?;
    // The console belongs to the prompt, so logs go to the file only.
    let _log_guard = init_logging(&ShoalPaths::logs_dir()?, "shoal-peer.log", "info", false)?;

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => ShoalPaths::peer_config_path()?,
    };
    let mut config = PeerConfig::load_or_default(&config_path);
    if !config_path.exists() {
        if let Err(e) = config.save_to_file(&config_path) {
            warn!("Could not write default config to {}: {e}", config_path.display());
        }
    }
    config.coordinator_addr = SocketAddr::new(args.server_host, args.server_port);
    // Other peers dial the host the coordinator observes for us.
    if !args.server_host.is_loopback() && config.transfer_bind.ip().is_loopback() {
        config.transfer_bind.set_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    let mut console = Console::new();
    let mut username = args.username.clone();
    let agent = loop {
        let name = match username.take() {
            Some(name) => name,
            None => match console.prompt("Username: ").await? {
                Some(name) => name.trim().to_string(),
                None => return Ok(()),
            },
        };
        let Some(password) = console.prompt("Password: ").await? else {
            return Ok(());
        };

        let shared_dir = LocalDirectory::new(args.shared_root.join(&name));
        match PeerAgent::start(config.clone(), name.as_str(), password, shared_dir).await {
            Ok(agent) => break agent,
            Err(NetworkError::AuthenticationFailed) => {
                warn!("Login rejected for {name}");
                println!("Authentication failed. Please try again.");
            }
            Err(NetworkError::InvalidArgument(msg)) => println!("{msg}"),
            Err(NetworkError::PeerUnavailable(_)) => {
                bail!(
                    "Coordination service at {} is not responding",
                    config.coordinator_addr
                );
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to start peer for {name}"));
            }
        }
    };

    info!(
        "Logged in as {} (transfers on {}, sharing {})",
        agent.username(),
        agent.transfer_addr(),
        agent.shared_dir().root().display()
    );
    cli::run(agent, &mut console).await
}
