//! Sofia transit CLI
//!
//! Polls sofiatraffic.bg for the configured stops and prints the normalized
//! line records as JSON.

#![allow(clippy::print_stdout)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use integration_sofia_transit::{
    AggregateResult, RefreshCoordinator, SofiaTrafficClient, SofiaTransitConfig, TokenStore,
    parse_stop_ids,
};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sofia transit CLI
#[derive(Parser)]
#[command(name = "sofia-transit")]
#[command(author, version, about = "Real-time arrivals for Sofia public transport", long_about = None)]
struct Cli {
    /// Verbosity level
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (defaults to ./sofia_transit.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Comma-separated stop ids, overriding the configuration
    #[arg(short, long, global = true)]
    stops: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single refresh cycle and print the result
    Once {
        /// Pretty-print the JSON output
        #[arg(short, long)]
        pretty: bool,
    },

    /// Refresh on an interval and print every published result
    ///
    /// Runs until Ctrl+C.
    Watch {
        /// Seconds between refresh cycles
        #[arg(short, long)]
        interval: Option<u64>,

        /// Pretty-print the JSON output
        #[arg(short, long)]
        pretty: bool,
    },

    /// Check a stop list without contacting the provider
    Validate {
        /// Stop ids to check (defaults to the configured list)
        ids: Option<String>,
    },
}

/// Determine log filter level from verbosity count
const fn log_filter_from_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Layer command-line flags over the loaded configuration
fn apply_overrides(
    mut config: SofiaTransitConfig,
    stops: Option<String>,
    interval: Option<u64>,
) -> SofiaTransitConfig {
    if let Some(stops) = stops {
        config.bus_stop_ids = stops;
    }
    if let Some(interval) = interval {
        config.update_interval_secs = interval;
    }
    config
}

/// Serialize an aggregate for stdout
fn render(aggregate: &AggregateResult, pretty: bool) -> serde_json::Result<String> {
    if pretty {
        serde_json::to_string_pretty(aggregate)
    } else {
        serde_json::to_string(aggregate)
    }
}

fn build_coordinator(
    config: &SofiaTransitConfig,
) -> anyhow::Result<RefreshCoordinator<SofiaTrafficClient>> {
    config.validate().context("invalid configuration")?;
    let stop_ids = config.stop_ids()?;
    let client = SofiaTrafficClient::new(config, Arc::new(TokenStore::new()))?;

    info!(stops = ?stop_ids, base_url = %config.base_url, "Configured stops");

    Ok(RefreshCoordinator::new(
        client,
        stop_ids,
        config.update_interval(),
        config.failure_threshold,
    ))
}

/// Resolve on Ctrl+C
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("📥 Received Ctrl+C, stopping");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = log_filter_from_verbosity(cli.verbose);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let loaded = SofiaTransitConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    match cli.command {
        Commands::Once { pretty } => {
            let config = apply_overrides(loaded, cli.stops, None);
            let mut coordinator = build_coordinator(&config)?;

            let aggregate = coordinator
                .first_refresh()
                .await
                .context("refresh cycle failed")?;
            println!("{}", render(&aggregate, pretty)?);
        },

        Commands::Watch { interval, pretty } => {
            let config = apply_overrides(loaded, cli.stops, interval);
            let mut coordinator = build_coordinator(&config)?;

            let aggregate = coordinator
                .first_refresh()
                .await
                .context("initial refresh failed")?;
            println!("{}", render(&aggregate, pretty)?);

            let published = coordinator.published();
            let mut versions = published.subscribe();
            let printer = tokio::spawn(async move {
                while versions.changed().await.is_ok() {
                    if let Some(aggregate) = published.latest() {
                        match render(&aggregate, pretty) {
                            Ok(json) => println!("{json}"),
                            Err(e) => error!(error = %e, "Failed to serialize result"),
                        }
                    }
                }
            });

            coordinator.run(shutdown_signal()).await;
            printer.abort();
        },

        Commands::Validate { ids } => {
            let raw = ids.or(cli.stops).unwrap_or(loaded.bus_stop_ids);

            match parse_stop_ids(&raw) {
                Ok(ids) => {
                    println!("✅ {} stop(s): {}", ids.len(), ids.join(", "));
                },
                Err(e) => {
                    println!("❌ {e}");
                    std::process::exit(1);
                },
            }
        },
    }

    Ok(())
}
