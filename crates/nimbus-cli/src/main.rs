//! Nimbus CLI - runs the device agent or the ingestion service.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nimbus_agent::{FsSystemState, PhaseDetector, ReportingLoop};
use nimbus_core::NimbusConfig;
use serde_json::json;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(author, version, about = "Provisioning telemetry for Autopilot deployments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "nimbus.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device agent until interrupted
    Agent {
        /// Ingestion service base URL
        #[arg(long)]
        endpoint: Option<String>,

        /// Seconds between samples
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Run the ingestion service until interrupted
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,

        /// Database file
        #[arg(long)]
        database: Option<PathBuf>,
    },

    /// Detect the current deployment phase once and print it
    Detect {
        /// Root of the system-state tree
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Write a default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Cancel on Ctrl+C
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
        trigger.cancel();
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::InitConfig { force } => {
            if cli.config.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    cli.config.display()
                );
            }
            NimbusConfig::write_default(&cli.config)?;
            println!("Wrote {}", cli.config.display());
        }

        Commands::Agent { endpoint, interval } => {
            let mut config = NimbusConfig::load_or_default(&cli.config)
                .with_context(|| format!("Failed to load {}", cli.config.display()))?;
            if let Some(endpoint) = endpoint {
                config.agent.api_endpoint = endpoint;
            }
            if let Some(interval) = interval {
                config.agent.interval_seconds = interval;
            }

            let reporting = ReportingLoop::from_settings(config.agent)?;
            info!("Agent reporting as {}", reporting.identity().client_id);

            let state = reporting.run(shutdown_token()).await;
            info!("Agent exited in state {:?}", state);
        }

        Commands::Serve { bind, database } => {
            let mut config = NimbusConfig::load_or_default(&cli.config)
                .with_context(|| format!("Failed to load {}", cli.config.display()))?;
            if let Some(bind) = bind {
                config.server.bind_addr = bind;
            }
            if let Some(database) = database {
                config.server.database_path = database;
            }

            nimbus_server::run(config.server, shutdown_token()).await?;
        }

        Commands::Detect { root } => {
            let config = NimbusConfig::load_or_default(&cli.config)?;
            let root = root.unwrap_or(config.agent.system_state_root);

            let detector = PhaseDetector::new(FsSystemState::new(root));
            let phase = detector.detect();
            let enrollment = detector.enrollment_status();

            let report = json!({
                "phase": phase.phase,
                "progress": phase.progress,
                "status": phase.status,
                "error": phase.error,
                "esp_active": enrollment.is_active,
                "enrollment_state": enrollment.enrollment_state,
                "last_error": enrollment.last_error,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
