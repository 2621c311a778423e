//! `chaos-sim`: run a Chaos network simulation from a topology file.

use chaos_runner::{run, RunnerError, Topology};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chaos-sim", version, about = "Simulate Chaos synchronous-transmission flooding")]
struct Cli {
    /// Topology file (YAML)
    #[arg(short, long)]
    topology: PathBuf,

    /// Simulated duration in seconds
    #[arg(short, long, default_value_t = 20.0)]
    seconds: f64,

    /// Random seed
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the results as JSON, including every round report
    #[arg(long)]
    json: bool,
}

fn execute(cli: &Cli) -> Result<(), RunnerError> {
    let topology = Topology::load(&cli.topology)?;
    info!(
        topology = %cli.topology.display(),
        nodes = topology.nodes.len(),
        seconds = cli.seconds,
        seed = cli.seed,
        "starting simulation"
    );
    let stats = run(&topology, cli.seconds, cli.seed)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("{}", stats);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with_writer(std::io::stderr)
        .init();
    chaos_metrics::describe_metrics();

    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
