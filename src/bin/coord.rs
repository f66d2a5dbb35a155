//! Coordinator binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tpckv::{common::Config, CoordinatorServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tpckv-coord")]
#[command(about = "tpckv two-phase commit coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for client requests
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Bind address for replica registration
        #[arg(long)]
        registration: Option<SocketAddr>,

        /// Replicas that must register before clients are served
        #[arg(long)]
        replicas: Option<usize>,

        /// Read cache capacity (entries)
        #[arg(long)]
        cache_size: Option<usize>,

        /// Concurrent client handlers
        #[arg(long)]
        workers: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // File and environment first, CLI arguments override
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
            registration,
            replicas,
            cache_size,
            workers,
        } => {
            let mut coord_config = config.coordinator.clone().unwrap_or_default();
            if let Some(bind) = bind {
                coord_config.bind_addr = bind;
            }
            if let Some(registration) = registration {
                coord_config.registration_addr = registration;
            }
            if let Some(replicas) = replicas {
                coord_config.expected_replicas = replicas;
            }
            if let Some(cache_size) = cache_size {
                coord_config.cache_capacity = cache_size;
            }
            if let Some(workers) = workers {
                coord_config.workers = workers;
            }
            coord_config.validate()?;

            let node_id = id.unwrap_or(config.node_id);
            CoordinatorServer::new(coord_config, node_id).serve().await?;
        }
    }

    Ok(())
}
