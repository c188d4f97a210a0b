//! meshlab: OpenThread mesh lab automation
//!
//! Subcommands:
//! - `setup`: form the mesh from the configured leader and routers, pin its
//!   topology with MAC allowlists and log a diagnostic baseline
//! - `measure`: `setup`, then the ping and iperf3 sweeps
//! - `telemetry`: run on a node, publishing link metrics to MQTT

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use meshlab::config::Config;
use meshlab::experiment::Experiment;
use meshlab::ntp::log_ntp_time;
use meshlab::session::LocalSession;
use meshlab::telemetry;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "meshlab")]
#[command(author, version, about = "OpenThread mesh lab automation", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Skip the NTP reference time query
    #[arg(long)]
    no_ntp: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Form the mesh and pin its topology
    Setup,
    /// Form the mesh, then run the latency and throughput sweeps
    Measure,
    /// Publish this node's link telemetry to MQTT until Ctrl+C
    Telemetry,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let started = Local::now();

    // Load configuration
    let config = Config::load(&cli.config).with_context(|| format!("Failed to load {}", cli.config))?;

    // Initialize tracing from the logging section
    let dispatch = config
        .logging
        .dispatch(&started.format("%Y%m%d_%H%M%S").to_string())
        .context("Failed to set up logging")?;
    tracing::dispatcher::set_global_default(dispatch).context("Logging already initialised")?;

    info!(experiment = %config.experiment.name, "meshlab starting");

    if !cli.no_ntp {
        log_ntp_time(&config.ntp).await;
    }

    let result = match cli.command {
        Commands::Setup => run_experiment(&config, &started.format("%d%m%y").to_string(), false).await,
        Commands::Measure => run_experiment(&config, &started.format("%d%m%y").to_string(), true).await,
        Commands::Telemetry => run_telemetry(&config).await,
    };

    if let Err(e) = &result {
        error!("meshlab stopped with an error: {:#}", e);
    } else {
        info!("meshlab finished");
    }
    result
}

async fn run_experiment(config: &Config, day: &str, measure: bool) -> Result<()> {
    let mut experiment = Experiment::connect(config, day).await?;
    info!(network = %experiment.network_name(), "Connected to all nodes");

    let mut result = experiment.setup().await;
    if result.is_ok() && measure {
        result = experiment.run_measurements().await;
    }

    experiment.disconnect().await;
    result
}

async fn run_telemetry(config: &Config) -> Result<()> {
    let mqtt = config
        .mqtt
        .as_ref()
        .context("The telemetry command needs an [mqtt] section")?;
    let session = LocalSession::new(Duration::from_secs(config.telemetry.command_timeout_secs));
    telemetry::run(&session, mqtt, &config.telemetry).await
}
