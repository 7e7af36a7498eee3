//! Edge Agent
//!
//! Supervises the configured data-collection backends on this host, applies
//! policies to them and reports their health until asked to stop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edge_agent::backend::BackendRegistry;
use edge_agent::comms::LoopbackTransport;
use edge_agent::{Agent, Config};

#[derive(Debug, Parser)]
#[command(name = "edge-agent", about = "Edge agent for data-collection backends")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the agent
    Run {
        /// Configuration file; may be repeated, later files override earlier ones
        #[arg(short = 'c', long = "config", env = "EDGE_CONFIG", value_delimiter = ',')]
        config: Vec<PathBuf>,

        /// Enable debug logging
        #[arg(short = 'd', long)]
        debug: bool,
    },
    /// Show agent version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Version => {
            println!("edge-agent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Run { config, debug } => run(config, debug).await,
    }
}

async fn run(paths: Vec<PathBuf>, debug: bool) -> Result<()> {
    let mut config = Config::load(&paths).context("failed to load configuration")?;
    if debug {
        config.agent.debug.enable = true;
    }

    let default_level = match (&config.log_level, config.debug()) {
        (Some(level), _) => level.clone(),
        (None, true) => "debug".to_string(),
        (None, false) => "info".to_string(),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let registry = Arc::new(BackendRegistry::with_default_backends());
    let transport = Arc::new(LoopbackTransport::disconnected());
    let agent = Agent::new(config, registry, transport)?;
    info!(agent_id = %agent.agent_id(), "configuration loaded");

    let root = CancellationToken::new();
    if let Err(e) = agent.start(root.clone()).await {
        error!(error = %e, "agent startup failed");
        agent.stop().await;
        std::process::exit(1);
    }

    tokio::select! {
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            agent.stop().await;
        }
        _ = root.cancelled() => {
            info!("agent stopped by control plane");
        }
    }

    info!("edge agent shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
