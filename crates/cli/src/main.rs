//! LLM Telemetry CLI
//!
//! Runs the collector and window aggregator as one service and offers
//! read-only inspection of the aggregation state and the dead-letter queue.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use llm_telemetry_config::{ObservabilityConfig, PipelineConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "llm-telemetry",
    version,
    about = "LLM telemetry collector and windowed aggregator",
    long_about = "Ingests LLM usage events over HTTP, publishes them to a partitioned log \
                  and folds them into per-minute aggregate rows with exactly-once state."
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "TELEMETRY_CONFIG",
        value_name = "FILE",
        help = "Path to a YAML configuration file"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the collector HTTP surface and the aggregator
    #[command(name = "run", about = "Run the collector and aggregator until Ctrl-C")]
    Run,

    /// Inspect a state store
    #[command(name = "state", about = "Print offset cursors, open windows and pending emissions")]
    State {
        /// State directory (defaults to state.path from the configuration)
        #[arg(long, value_name = "DIR")]
        path: Option<PathBuf>,
    },

    /// List dead-letter records
    #[command(name = "dlq", about = "List dead-letter records")]
    Dlq {
        /// Dead-letter directory (defaults to dead_letter.path from the configuration)
        #[arg(long, value_name = "DIR")]
        path: Option<PathBuf>,

        /// Show at most this many records, newest last
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },

    /// Validate and print the effective configuration
    #[command(name = "check-config", about = "Load, validate and print the effective configuration")]
    CheckConfig,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.clone())?;

    init_tracing(&config.observability);

    match cli.command {
        Commands::Run => {
            config.validate()?;
            commands::run::execute(config).await
        }
        Commands::State { path } => {
            commands::state::execute(path.unwrap_or_else(|| config.state.path.clone())).await
        }
        Commands::Dlq { path, limit } => {
            commands::dlq::execute(path.unwrap_or_else(|| config.dead_letter.path.clone()), limit)
                .await
        }
        Commands::CheckConfig => commands::check_config::execute(&config),
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over the configured level.
fn init_tracing(config: &ObservabilityConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let json = config.json_logging;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_target(false)))
        .init();
}
