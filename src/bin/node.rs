//! Registry node binary

use clap::{Parser, Subcommand};
use minipg::{common::parse_duration, Config, RegistryNode};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minipg-node")]
#[command(about = "minipg replicated process-group registry node")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a registry node
    Serve {
        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// Ring nodes (comma-separated)
        #[arg(long, value_delimiter = ',')]
        nodes: Vec<String>,

        /// Number of ring partitions
        #[arg(long)]
        partitions: Option<u64>,

        /// Replication factor
        #[arg(long)]
        n: Option<usize>,

        /// Replies required before answering
        #[arg(long)]
        r: Option<usize>,

        /// Quorum deadline, e.g. 5s or 500ms
        #[arg(long)]
        timeout: Option<String>,

        /// Snapshot directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            id,
            bind,
            nodes,
            partitions,
            n,
            r,
            timeout,
            data_dir,
        } => {
            // File and environment first, CLI arguments take priority
            let mut config = Config::load()?;
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind.parse()?;
            }
            if !nodes.is_empty() {
                config.cluster.nodes = nodes;
            }
            if let Some(partitions) = partitions {
                config.cluster.num_partitions = partitions;
            }
            if let Some(n) = n {
                config.cluster.n_val = n;
            }
            if let Some(r) = r {
                config.cluster.r_val = r;
            }
            if let Some(timeout) = timeout {
                config.cluster.request_timeout_ms = parse_duration(&timeout)?.as_millis() as u64;
            }
            if data_dir.is_some() {
                config.cluster.data_dir = data_dir;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            RegistryNode::new(config).serve().await?;
        }
    }

    Ok(())
}
