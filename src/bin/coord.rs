//! Coordinator binary

use clap::{Parser, Subcommand};
use multiupdate::{common::Config, Coordinator};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "multiupdate-coord")]
#[command(about = "Multi-update coordinator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// Database directory
        #[arg(long)]
        db: Option<PathBuf>,

        /// Shard endpoints (comma-separated)
        #[arg(long, value_delimiter = ',')]
        shards: Vec<String>,

        /// Config server endpoint
        #[arg(long)]
        config_server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            db,
            shards,
            config_server,
        } => {
            // File and environment first, CLI arguments take priority
            let mut config = Config::load(config.as_deref())?;

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.as_str().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.coordinator.bind_addr = bind.parse()?;
            }
            if let Some(db) = db {
                config.coordinator.db_path = db;
            }
            if !shards.is_empty() {
                config.coordinator.shards = shards;
            }
            if let Some(config_server) = config_server {
                config.coordinator.config_server = config_server;
            }

            let coord = Coordinator::new(config.coordinator, config.node_id);
            coord.serve().await?;
        }
    }

    Ok(())
}
