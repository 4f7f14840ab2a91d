//! perfflux - performance data spool shipper
//!
//! ```bash
//! # Run the collector (default)
//! perfflux --config /etc/perfflux.toml
//!
//! # Validate a config file
//! perfflux check --config /etc/perfflux.toml
//!
//! # Print every series stored in the configured database
//! perfflux query
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perfflux::{logging, select_all, CancellationToken, Config, InfluxDestination, Pipeline};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "perfflux")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, default_value = "perfflux.toml", global = true)]
    config: PathBuf,

    /// Log filter, overrides `[log] level` (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the spool folders and ship their contents
    Run,
    /// Load and validate the configuration, then exit
    Check,
    /// Print all series of the configured database as JSON
    Query,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            logging::init(&config.log, cli.log_level.as_deref())?;
            run(config).await
        }
        Command::Check => {
            println!("{} is valid", cli.config.display());
            Ok(())
        }
        Command::Query => query(&config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    let cxl = CancellationToken::new();
    let pipeline = Pipeline::start(cxl.clone(), config).await?;
    let stats = pipeline.stats().clone();
    info!("perfflux started");

    tokio::spawn(async move {
        shutdown_signal().await;
        cxl.cancel();
    });
    pipeline.join().await;

    info!(status = %serde_json::to_string(&stats.snapshot())?, "final status");

    Ok(())
}

async fn query(config: &Config) -> Result<()> {
    let destination = InfluxDestination::new(&config.influx)?;
    let response = select_all(destination.client(), &config.influx).await?;
    let series: Vec<_> = response.series().collect();
    println!("{}", serde_json::to_string_pretty(&series)?);

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
