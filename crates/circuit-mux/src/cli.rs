use clap::{Parser, Subcommand};
use cmx_core::OutputFormat;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cmx")]
#[command(about = "circuit-mux: adaptive multipath scheduling for voice frames")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a synthetic call over lossy virtual circuits
    Simulate(SimulateArgs),

    /// Manage scheduler configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of circuits (overrides the config file)
    #[arg(long)]
    pub circuits: Option<usize>,

    /// Virtual call length in seconds
    #[arg(long, default_value_t = 120)]
    pub duration_secs: u64,

    /// Seed for both the network model and circuit selection
    #[arg(long)]
    pub seed: Option<u64>,

    /// Per-circuit frame loss probability, comma-separated (missing entries are 0)
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub loss: Vec<f64>,

    /// Per-circuit local send failure probability, comma-separated
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    pub send_failure: Vec<f64>,

    /// Interval between receiver feedback messages
    #[arg(long, default_value_t = 5_000)]
    pub feedback_interval_ms: u64,

    /// Probability that a circuit rebuild succeeds
    #[arg(long, default_value_t = 0.8)]
    pub rebuild_success: f64,

    /// Virtual time a rebuild takes to complete
    #[arg(long, default_value_t = 2_000)]
    pub rebuild_latency_ms: u64,

    /// Scheduler config file (defaults to the user config, then built-ins)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Include every telemetry event in the report
    #[arg(long)]
    pub events: bool,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write the default config template
    Init {
        /// Target path (defaults to the user config path)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate a configuration file
    Validate {
        /// Config file (defaults to the user config path)
        path: Option<PathBuf>,
    },
    /// Show the effective configuration
    Show {
        /// Config file (defaults to the user config, then built-ins)
        path: Option<PathBuf>,
    },
}
