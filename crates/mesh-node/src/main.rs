use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mesh_network::TcpTransport;
use mesh_node::{NetworkManager, NodeConfig, SignalingEndpoint};

#[derive(Parser)]
#[command(name = "mesh-node", version, about = "Agent mesh node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a node and run until interrupted.
    Run {
        /// Configuration file (defaults to the user config directory).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override `node_id` from the config file.
        #[arg(long)]
        node_id: Option<String>,

        /// Override `network.listen_addr`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Print a configuration file with every default filled in.
    InitConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::InitConfig => {
            print!("{}", NodeConfig::default().to_toml_string()?);
            Ok(())
        }
        Command::Run {
            config,
            node_id,
            listen,
        } => {
            let mut config = NodeConfig::load_or_default(config.as_deref())?;
            if let Some(node_id) = node_id {
                config.node_id = node_id;
            }
            if let Some(listen) = listen {
                config.network.listen_addr = listen;
            }
            init_logging(&config.logging.filter);
            run_node(config).await
        }
    }
}

async fn run_node(config: NodeConfig) -> anyhow::Result<()> {
    if config.signaling_endpoint == SignalingEndpoint::Loopback {
        bail!("the loopback signaling endpoint only exists inside one process; use tcp");
    }
    let directory: HashMap<_, _> = config.peer_directory().into_iter().collect();
    let transport = Arc::new(
        TcpTransport::new(config.node_id(), config.network.listen_addr.clone(), directory)
            .with_handshake_timeout(config.handshake_timeout()),
    );

    let manager = NetworkManager::new(config, transport).context("creating network manager")?;
    manager.initialize().await.context("starting node")?;
    if let Some(key) = manager.public_key() {
        tracing::info!(public_key = %key, "Node identity");
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("Interrupt received");
    manager.shutdown().await?;
    Ok(())
}
