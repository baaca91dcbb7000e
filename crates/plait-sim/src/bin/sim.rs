#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use plait_sim::{SimulationConfig, run_simulation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "plait-sim: replica convergence under simulated network faults",
    long_about = None
)]
struct Cli {
    /// Scenario file (TOML). Missing file means defaults.
    #[arg(short, long, default_value = "plait-sim.toml")]
    config: PathBuf,

    /// Override the scenario seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Override the number of nodes.
    #[arg(long)]
    nodes: Option<usize>,

    /// Run this many consecutive seeds starting at the scenario seed.
    #[arg(long, default_value_t = 1)]
    runs: u64,

    /// Emit each report as JSON instead of a summary line.
    #[arg(long)]
    json: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("PLAIT_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "plait_core=debug,plait_sim=debug,info"
        } else {
            "plait_sim=info,warn"
        })
    });

    let format = env::var("PLAIT_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry.with(fmt::layer().json().with_ansi(false)).init();
        }
        _ => {
            registry.with(fmt::layer().compact()).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config: SimulationConfig = plait_core::config::load_toml(&cli.config)?;
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(nodes) = cli.nodes {
        config.nodes = nodes;
    }

    let first = config.seed;
    let mut failed = Vec::new();
    for seed in first..first.saturating_add(cli.runs.max(1)) {
        config.seed = seed;
        let report = run_simulation(&config).await?;
        if cli.json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!(
                "simulation complete: seed={} published={} partitions={} converged={} settle_ms={} dead_letters={} abandoned={}",
                report.seed,
                report.published,
                report.partitions,
                report.convergence.converged,
                report.settle_ms,
                report.metrics.dead_letters,
                report.metrics.abandoned,
            );
        }
        if !report.convergence.converged {
            failed.push(seed);
        }
    }

    if !failed.is_empty() {
        bail!("{} run(s) did not converge; first failing seed: {}", failed.len(), failed[0]);
    }
    Ok(())
}
