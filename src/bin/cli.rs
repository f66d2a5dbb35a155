//! CLI for reading and writing keys

use clap::{Parser, Subcommand};
use tpckv::common::{ClientConfig, Config, ValueCipher};
use tpckv::{Error, KvClient};

#[derive(Parser)]
#[command(name = "tpckv")]
#[command(about = "tpckv replicated key-value store CLI")]
#[command(version)]
struct Cli {
    /// Coordinator client endpoint
    #[arg(long)]
    coordinator: Option<String>,

    /// Base64 master key for client-side value encryption
    #[arg(long, env = "TPCKV_ENCRYPTION_KEY")]
    encryption_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read a key
    Get {
        /// Key
        key: String,
    },

    /// Write a key
    Put {
        /// Key
        key: String,

        /// Value
        value: String,
    },

    /// Delete a key
    Delete {
        /// Key
        key: String,
    },

    /// Print a fresh encryption master key
    GenerateKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::load()?;

    let mut client_config: ClientConfig = config.client.unwrap_or_default();
    if let Some(coordinator) = cli.coordinator {
        client_config.coordinator_addr = coordinator;
    }
    if cli.encryption_key.is_some() {
        client_config.encryption_key = cli.encryption_key;
    }

    match cli.command {
        Commands::GenerateKey => {
            println!("{}", ValueCipher::generate_master_key());
        }

        Commands::Get { key } => {
            let client = KvClient::new(client_config)?;
            match client.get(key.as_bytes()).await {
                Ok(value) => println!("{}", String::from_utf8_lossy(&value)),
                Err(Error::NotFound(_)) => {
                    eprintln!("{}: not found", key);
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Put { key, value } => {
            let client = KvClient::new(client_config)?;
            let existed = client.put(key.as_bytes(), value.as_bytes()).await?;
            if existed {
                println!("PUT {} (overwritten)", key);
            } else {
                println!("PUT {}", key);
            }
        }

        Commands::Delete { key } => {
            let client = KvClient::new(client_config)?;
            match client.delete(key.as_bytes()).await {
                Ok(()) => println!("DELETE {}", key),
                Err(Error::NotFound(_)) => {
                    eprintln!("{}: not found", key);
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}
