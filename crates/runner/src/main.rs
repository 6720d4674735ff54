mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yieldsync_core::{load_config, validate_config};

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Incremental bond yield ingestion.
#[derive(Parser, Debug)]
#[command(name = "yieldsync", version, about)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, env = "YIELDSYNC_CONFIG", default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every stale (entity, period) pair once.
    Sync,
    /// Capture live table snapshots.
    Realtime {
        /// Take a single snapshot and exit.
        #[arg(long)]
        once: bool,
    },
    /// Answer interceptor hook events on stdin/stdout.
    Intercept,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    init_tracing(matches!(cli.command, Command::Intercept));

    info!(version = VERSION, "Loading configuration from {:?}", cli.config);
    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    validate_config(&config).context("Configuration validation failed")?;

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        config_hash = &config_hash[..16],
        database = ?config.database.path,
        "Configuration loaded"
    );

    match cli.command {
        Command::Sync => commands::sync(config).await,
        Command::Realtime { once } => commands::realtime(config, once).await,
        Command::Intercept => commands::intercept(config).await,
    }
}

/// The hook bridge owns stdout, so its logs go to stderr.
fn init_tracing(to_stderr: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    if to_stderr {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
