//! Replica binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tpckv::{common::Config, ReplicaServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tpckv-replica")]
#[command(about = "tpckv replica (two-phase commit participant)")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start replica server
    Serve {
        /// Ring identifier (decimal)
        #[arg(long)]
        id: Option<u64>,

        /// Bind address for coordinator traffic
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Host name announced to the coordinator
        #[arg(long)]
        advertise_host: Option<String>,

        /// Coordinator registration endpoint
        #[arg(long)]
        coordinator: Option<String>,

        /// Participant log file
        #[arg(long)]
        log: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            advertise_host,
            coordinator,
            log,
        } => {
            let mut replica_config = config.replica.unwrap_or_default();
            if let Some(id) = id {
                replica_config.node_id = id;
            }
            if let Some(bind) = bind {
                replica_config.bind_addr = bind;
            }
            if let Some(host) = advertise_host {
                replica_config.advertise_host = host;
            }
            if let Some(coordinator) = coordinator {
                replica_config.coordinator_addr = coordinator;
            }
            if let Some(log) = log {
                replica_config.log_path = log;
            }
            replica_config.validate()?;

            ReplicaServer::new(replica_config).serve().await?;
        }
    }

    Ok(())
}
