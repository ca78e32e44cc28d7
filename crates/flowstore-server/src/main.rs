//! Flowstore simulation entry point
//!
//! Boots several in-process store nodes, drives batches through them and
//! prints a report. Configuration is layered from `conf/flowstore.yml`,
//! `FLOWSTORE__*` environment variables (`FLOWSTORE__NODE__ID`
//! style, `__` separating key segments) and command line flags.

use anyhow::Context;
use clap::Parser;
use config::{Config, Environment};
use tracing::{error, info};

use flowstore_core::Configuration;
use flowstore_server::{
    Simulation, SimulationConfig,
    metrics::init_metrics,
    startup::{LoggingConfig, init_logging, run_with_shutdown, wait_for_shutdown_signal},
};

/// Command line arguments for the simulation
#[derive(Debug, Parser)]
#[command(version, about = "Replicated flow rule store simulation")]
struct Cli {
    /// Configuration file, without or with extension
    #[arg(short = 'c', long = "config", default_value = "conf/flowstore")]
    config: String,
    #[arg(short = 'n', long = "nodes")]
    nodes: Option<u32>,
    #[arg(short = 'd', long = "devices")]
    devices: Option<u32>,
    #[arg(short = 'b', long = "batches")]
    batches: Option<u32>,
    #[arg(long = "failure-rate")]
    failure_rate: Option<f64>,
}

fn load_configuration(args: &Cli) -> anyhow::Result<Configuration> {
    let mut builder = Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(
            Environment::with_prefix("FLOWSTORE")
                .separator("__")
                .keep_prefix(true)
                .try_parsing(true),
        );

    if let Some(v) = args.nodes {
        builder = builder.set_override("flowstore.simulation.nodes", i64::from(v))?;
    }
    if let Some(v) = args.devices {
        builder = builder.set_override("flowstore.simulation.devices", i64::from(v))?;
    }
    if let Some(v) = args.batches {
        builder = builder.set_override("flowstore.simulation.batches", i64::from(v))?;
    }
    if let Some(v) = args.failure_rate {
        builder = builder.set_override("flowstore.simulation.failure-rate", v)?;
    }

    let config = builder
        .build()
        .with_context(|| format!("failed to load configuration from {}", args.config))?;
    Ok(Configuration::from_config(config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let configuration = load_configuration(&args)?;

    let logging_config = if std::env::var("FLOWSTORE_LOG_DIR").is_ok() {
        LoggingConfig::from_env()
    } else {
        LoggingConfig::from_config(
            configuration.log_dir(),
            configuration.log_console_enabled(),
            configuration.log_file_enabled(),
            configuration.log_level(),
        )
    };
    let _logging_guard = init_logging(&logging_config)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    init_metrics();

    let simulation_config = SimulationConfig::from_configuration(&configuration);
    info!(
        nodes = simulation_config.nodes,
        devices = simulation_config.devices,
        batches = simulation_config.batches,
        failure_rate = simulation_config.failure_rate,
        "Starting flowstore simulation"
    );
    let simulation = Simulation::start(simulation_config)?;

    let shutdown = wait_for_shutdown_signal();
    let outcome = run_with_shutdown(simulation.run(), shutdown.subscribe()).await;

    let result = match outcome {
        Some(Ok(report)) => {
            let installed: usize = simulation
                .nodes()
                .iter()
                .map(|n| n.delegate.installed())
                .sum();
            let failed: usize = simulation.nodes().iter().map(|n| n.delegate.failed()).sum();
            info!(installed, failed, "Simulation finished: {}", report);
            Ok(())
        }
        Some(Err(e)) => {
            error!("Simulation failed: {:#}", e);
            Err(e)
        }
        None => {
            info!("Simulation interrupted");
            Ok(())
        }
    };

    simulation.shutdown().await;
    result
}
