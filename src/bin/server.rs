//! Metadata server binary

use clap::{Parser, Subcommand};
use shardmeta::common::{Config, StorageBackend};
use shardmeta::MetaServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardmeta-server")]
#[command(about = "shardmeta metadata control plane")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the metadata server
    Serve {
        /// Config file (TOML)
        #[arg(long, default_value = shardmeta::common::config::DEFAULT_CONFIG_FILE)]
        config: String,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// RocksDB directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep metadata in memory only
        #[arg(long)]
        memory: bool,

        /// Run shard placement on the background worker
        #[arg(long)]
        deferred_placement: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            bind,
            data_dir,
            memory,
            deferred_placement,
        } => {
            // File and environment first, CLI flags win
            let mut config = Config::load_from(&config)?;
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            if memory {
                config.server.backend = StorageBackend::Memory;
            }
            if deferred_placement {
                config.placement.deferred = true;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            MetaServer::new(config).serve().await?;
        }
    }

    Ok(())
}
