//! rust-pppac: PPP access concentrator
//!
//! This is the main entry point for the rust-pppac daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_pppac::config::Config;
use rust_pppac::dict::Dictionary;
use rust_pppac::session::Concentrator;

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Subcommand to run
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config/pppac.toml")]
    config: PathBuf,
}

/// Available subcommands
#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and dictionary
    #[command(about = "Validate the configuration and dictionary")]
    Test {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/pppac.toml")]
        config: PathBuf,
    },

    /// Start the concentrator
    #[command(about = "Start the concentrator")]
    Start {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/pppac.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match args.command {
        Some(Commands::Test { config }) => {
            tracing::info!(config = ?config, "testing configuration");
            let config = Config::from_file(&config)?;
            let dict = Dictionary::load(&config.radius.dictionary)
                .with_context(|| format!("loading {}", config.radius.dictionary.display()))?;
            tracing::info!(
                attributes = dict.len(),
                auth_server = %config.radius.auth_server,
                "configuration is valid"
            );
        }
        Some(Commands::Start { config }) => start(config).await?,
        None => start(args.config).await?,
    }

    Ok(())
}

async fn start(config_path: PathBuf) -> anyhow::Result<()> {
    tracing::info!(config = ?config_path, "starting concentrator");

    let config = Config::from_file(&config_path)?;
    let dict = Dictionary::load(&config.radius.dictionary)
        .with_context(|| format!("loading {}", config.radius.dictionary.display()))?;
    tracing::info!(attributes = dict.len(), "dictionary loaded");

    #[cfg(not(target_os = "linux"))]
    anyhow::bail!("PPP interface programming requires Linux");

    #[cfg(target_os = "linux")]
    {
        let iface = Arc::new(rust_pppac::iface::KernelIface::new()?);
        let concentrator = Arc::new(Concentrator::new(config, dict, iface));
        tracing::info!(
            auth_server = %concentrator.config().radius.auth_server,
            gateway = %concentrator.config().pool.gateway,
            "ready; tunnel transports attach sessions via the library API"
        );

        // Sessions are owned by their transports; the main task only holds
        // the shared state and waits for shutdown.
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal received, stopping");
    }

    Ok(())
}
