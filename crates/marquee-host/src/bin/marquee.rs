use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use marquee_bus::{DestinationFlags, HostEvent, SharedStatus};
use marquee_host::{Host, HostConfig};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => execute_run(args),
        Commands::CheckConfig(args) => execute_check_config(args),
    }
}

#[derive(Parser)]
#[command(author, version, about = "Message host for external peers and render workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a peer and broadcast the host events read from stdin, one
    /// `eventName [argsJson]` per line.
    Run(RunArgs),
    /// Print the resolved host configuration.
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Host configuration file (JSON). Defaults to the per-user location.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Peer executable, overriding the configured one.
    #[arg(long)]
    peer: Option<PathBuf>,
    /// Arguments passed through to the peer.
    #[arg(last = true)]
    peer_args: Vec<String>,
}

fn load_config(args: &ConfigArgs) -> Result<HostConfig> {
    HostConfig::load(args.config.as_deref()).context("failed to load host configuration")
}

fn execute_check_config(args: ConfigArgs) -> Result<()> {
    let config = load_config(&args)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn execute_run(args: RunArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(peer) = args.peer {
        config.peer = Some(peer);
    }
    if !args.peer_args.is_empty() {
        config.peer_args = args.peer_args;
    }

    let status = Arc::new(SharedStatus::new());
    let host = Host::new(config, status.clone())?;
    let peer = host.spawn_peer(host.config().peer_config())?;
    info!(%peer, "peer connected, reading events from stdin");

    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, args_json) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };

        let report = match HostEvent::from_wire(name, args_json) {
            Some(event) => {
                status.apply(&event);
                host.dispatch_host_event(&event)
            }
            None => host.dispatch(name, args_json, DestinationFlags::ALL),
        };
        debug!(name, delivered = report.delivered, failed = report.failed, "dispatched");

        if host.peers().is_empty() {
            warn!("peer went away");
            break;
        }
    }

    host.shutdown();
    Ok(())
}
