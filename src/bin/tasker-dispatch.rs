//! # Tasker Dispatch Server
//!
//! Runs the queue backend, the deployment build worker and the scheduler,
//! poller and build daemons as one process.
//!
//! ## Usage
//!
//! ```bash
//! # Run with the configured backend and in-memory stores seeded from a file
//! tasker-dispatch run --seed seed.json
//!
//! # Check configuration for an environment
//! TASKER_ENV=production tasker-dispatch validate-config
//! ```

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};

use tasker_dispatch::bootstrap::{DispatchBootstrap, DispatchPorts, StandaloneSeed};
use tasker_dispatch::config::ConfigLoader;
use tasker_dispatch::logging;

#[derive(Parser)]
#[command(name = "tasker-dispatch")]
#[command(about = "Job dispatch, scheduling and polling for Tasker workflows")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: $TASKER_CONFIG_DIR or config/dispatch)
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,

    /// Environment override (default: $TASKER_ENV or development)
    #[arg(short, long, global = true)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled component and run until Ctrl+C or SIGTERM
    Run {
        /// JSON file with workflows, pollers, operators and queue settings
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// Load and validate configuration, then print it with secrets masked
    ValidateConfig,
}

#[tokio::main]
async fn main() {
    logging::init_tracing();
    let cli = Cli::parse();

    let loader = match &cli.environment {
        Some(environment) => {
            ConfigLoader::load_from_directory_with_env(cli.config_dir.clone(), environment)
        }
        None => ConfigLoader::load_from_directory(cli.config_dir.clone()),
    };
    let loader = match loader {
        Ok(loader) => loader,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            process::exit(2);
        }
    };

    let exit_code = match cli.command {
        Commands::ValidateConfig => {
            match serde_json::to_string_pretty(&loader.sanitized_config()) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => warn!(error = %e, "Could not render configuration"),
            }
            info!(environment = %loader.environment(), "Configuration is valid");
            0
        }
        Commands::Run { seed } => run(&loader, seed).await,
    };
    process::exit(exit_code);
}

async fn run(loader: &ConfigLoader, seed: Option<PathBuf>) -> i32 {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %loader.environment(),
        "Starting Tasker dispatch server"
    );

    let seed = match seed {
        Some(path) => match StandaloneSeed::from_json_file(&path) {
            Ok(seed) => seed,
            Err(e) => {
                error!(error = %e, "Failed to load seed data");
                return 2;
            }
        },
        None => StandaloneSeed::default(),
    };

    let handle =
        match DispatchBootstrap::bootstrap(loader.config(), DispatchPorts::in_memory(seed)).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Failed to bootstrap dispatch components");
                return 1;
            }
        };

    info!("Dispatch server started; press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("Shutdown signal received, stopping");

    match handle.stop().await {
        Ok(()) => {
            info!("Dispatch server shutdown complete");
            0
        }
        Err(e) => {
            error!(error = %e, "Dispatch server did not stop cleanly");
            1
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
