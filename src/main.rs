//! `nozzle_inspect` command line.
//!
//! `simulate` runs a full station against the in-process mock controller and
//! prints the measurement results as JSON on stdout. `config` prints the
//! effective configuration. Logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nozzle_inspect::config::{InspectConfig, DEFAULT_CONFIG_PATH};
use nozzle_inspect::device::DeviceId;
use nozzle_inspect::gateway::mock::{MockService, Reply};
use nozzle_inspect::notify::ActiveProblem;
use nozzle_inspect::orchestrator::{CyclePhase, CycleSnapshot};
use nozzle_inspect::{DeviceSnapshot, Station};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Nozzle inspection station controller
#[derive(Parser, Debug)]
#[command(name = "nozzle_inspect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/inspect.toml)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run measurement cycles against the simulated controller
    Simulate {
        /// Number of cycles to run back to back
        #[arg(short = 'n', long, default_value_t = 1)]
        cycles: usize,

        /// Make a device drop out once and come back through reconnect
        #[arg(long, value_name = "DEVICE")]
        flaky: Vec<String>,

        /// Random class counts instead of the deterministic pattern
        #[arg(long)]
        random: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Serialize)]
struct SimulationReport {
    cycles: Vec<CycleSnapshot>,
    devices: Vec<DeviceSnapshot>,
    problems: Vec<ActiveProblem>,
}

fn load_config(path: Option<&PathBuf>) -> Result<InspectConfig> {
    let config = match path {
        Some(path) => InspectConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => InspectConfig::load()
            .with_context(|| format!("Failed to load configuration from {DEFAULT_CONFIG_PATH}"))?,
    };
    Ok(config)
}

fn init_tracing(config: &InspectConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn simulate(
    config: InspectConfig,
    cycles: usize,
    flaky: &[String],
    random: bool,
) -> Result<SimulationReport> {
    let mut service = MockService::new().with_class_count(config.cycle.class_count);
    if random {
        service = service.with_random_counts();
    }
    for device in flaky {
        let id = DeviceId::new(device);
        service.script_status(&id, [Reply::Ok, Reply::Unreachable]);
        service.script_connect(&id, [Reply::Unreachable, Reply::Ok]);
    }

    let station = Station::start(config, Arc::new(service)).context("Failed to start station")?;
    let mut cycle = station.watch_cycle();
    let mut reports = Vec::with_capacity(cycles);

    for n in 1..=cycles {
        if !station.start_cycle().await? {
            bail!("A measurement cycle was already running");
        }
        let finished = cycle
            .wait_for(|s| !s.active)
            .await
            .context("Orchestrator stopped during the cycle")?
            .clone();
        info!(cycle = n, phase = ?finished.phase, samples = finished.results.len(), "Cycle finished");
        if finished.phase == CyclePhase::Faulted {
            warn!(reason = ?finished.last_error, "Cycle faulted, not starting further cycles");
            reports.push(finished);
            break;
        }
        reports.push(finished);
    }

    let report = SimulationReport {
        cycles: reports,
        devices: station.device_states(),
        problems: station.active_problems(),
    };
    station.shutdown().await?;
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
        Command::Simulate {
            cycles,
            flaky,
            random,
        } => {
            init_tracing(&config);
            let report = simulate(config, cycles, &flaky, random).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
