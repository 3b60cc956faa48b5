//! Telemetry Simulator CLI
//!
//! Two modes:
//! - run: execute a simulation from a JSON configuration and print the event
//!   feed until the run ends
//! - check: parse and expand a configuration and print the planned jobs
//!   without dispatching anything

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use tracing::info;

use simulation_engine::{planner, RunOptions, Simulation, SimulationConfig, SimulationEvent};

#[derive(Parser)]
#[command(name = "simulator-cli")]
#[command(about = "Synthetic telemetry simulator for context brokers and IoT agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulation and print its event feed
    Run {
        /// Path to the JSON simulation configuration
        #[arg(short, long)]
        config: String,

        /// Fast-forward from this instant (RFC 3339) on a virtual clock
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// End a fast-forward run at this instant (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,

        /// Emit progress information every this many milliseconds
        #[arg(long)]
        progress_ms: Option<u64>,

        /// Backpressure margin: maximum outstanding updates (negative disables)
        #[arg(long, default_value = "-1")]
        margin: i64,

        /// Re-enqueue delay for backpressure-delayed updates, in milliseconds
        #[arg(long, default_value = "1000")]
        delay_ms: u64,

        /// Only print errors and the final end event
        #[arg(long)]
        silent: bool,
    },

    /// Parse a configuration and print the planned jobs
    Check {
        /// Path to the JSON simulation configuration
        #[arg(short, long)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, from, to, progress_ms, margin, delay_ms, silent } => {
            let config = load_config(&config)?;
            let options = RunOptions {
                from_date: from,
                to_date: to,
                progress_interval_ms: progress_ms,
                maximum_not_responded: margin,
                delay_ms,
            };
            run(config, options, silent).await
        }
        Commands::Check { config } => check(load_config(&config)?),
    }
}

fn load_config(path: &str) -> Result<SimulationConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {path}"))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse configuration file {path}"))
}

async fn run(config: SimulationConfig, options: RunOptions, silent: bool) -> Result<()> {
    let simulation = std::sync::Arc::new(
        Simulation::start(config, options).await.context("Failed to start the simulation")?,
    );
    let mut events = simulation.events();

    let interrupt = {
        let simulation = simulation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping simulation");
                simulation.stop();
            }
        })
    };

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                eprintln!("{}", format!("... {missed} events dropped (slow terminal)").yellow());
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        print_event(&event, silent);
        if matches!(event, SimulationEvent::End) {
            break;
        }
    }

    interrupt.abort();
    Ok(())
}

fn print_event(event: &SimulationEvent, silent: bool) {
    let name = event.name();
    if silent && !matches!(event, SimulationEvent::Error { .. } | SimulationEvent::End) {
        return;
    }
    let label = match event {
        SimulationEvent::Error { .. } => name.red().bold(),
        SimulationEvent::End | SimulationEvent::Stop => name.cyan().bold(),
        SimulationEvent::ProgressInfo(_) => name.blue(),
        _ => name.green(),
    };
    match serde_json::to_string(event) {
        Ok(details) => println!("{label} {details}"),
        Err(_) => println!("{label}"),
    }
}

fn check(config: SimulationConfig) -> Result<()> {
    let expanded = config.expanded().context("Count expansion failed")?;
    let jobs = planner::plan(&expanded).context("Schedule planning failed")?;
    println!(
        "{} {} entities, {} devices, {} jobs",
        "configuration ok:".green().bold(),
        expanded.entities.len(),
        expanded.devices.len(),
        jobs.len()
    );
    for job in &jobs {
        println!("  {} [{}]", job.name.bold(), job.schedule.describe());
    }
    Ok(())
}
