mod config;
mod fetch;
mod progress;
mod root;
mod share;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use crate::config::AppConfig;

/// Sluice - share a directory and pull files from it over many TCP connections.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Share a directory (or a single file) with peers.
    Share {
        path: PathBuf,

        /// Address to listen on.
        #[clap(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,
    },
    /// Download files from a sharing peer.
    Fetch {
        /// Host name or address of the sharing peer, optionally with a port.
        host: String,

        /// Only fetch this file from the shared root.
        #[clap(long)]
        file: Option<String>,

        /// Directory to write downloads into.
        #[clap(long, default_value = ".")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sluice=info,sluice_transfer=info,sluice_net=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Command::Share { path, bind } => share::run(&path, bind, config).await,
        Command::Fetch { host, file, out } => {
            let server = fetch::resolve(&host, config.control_port).await?;
            let reports = fetch::run(server, file.as_deref(), &out, config).await?;
            info!("fetched {} file(s) from {}", reports.len(), server);
            Ok(())
        }
    }
}
