//! CLI Entry Point for rust-station
//!
//! # Usage
//!
//! Run every slot once:
//! ```bash
//! rust-station run --config station.toml
//! rust-station run --config station.toml --slots 2 --continue-on-fail
//! ```
//!
//! List the registered steps (built-in and trusted plugins):
//! ```bash
//! rust-station steps --config station.toml
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_station::config::StationConfig;
use rust_station::sequence::FailurePolicy;
use rust_station::station::StationController;
use rust_station::steps::StepRegistry;
use rust_station::tracing_setup;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "rust-station")]
#[command(about = "Multi-slot hardware validation station", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured step plan on every slot
    Run {
        /// Station config file (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Override the number of slots
        #[arg(long)]
        slots: Option<u32>,

        /// Override the plugin directory
        #[arg(long)]
        plugins: Option<PathBuf>,

        /// Keep running steps after a failure
        #[arg(long)]
        continue_on_fail: bool,
    },

    /// List registered steps
    Steps {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            slots,
            plugins,
            continue_on_fail,
        } => run_station(config, slots, plugins, continue_on_fail).await,
        Commands::Steps { config } => list_steps(config),
    }
}

async fn run_station(
    config_path: PathBuf,
    slots: Option<u32>,
    plugins: Option<PathBuf>,
    continue_on_fail: bool,
) -> Result<()> {
    let mut config = StationConfig::load_from(&config_path)?;
    if let Some(slots) = slots {
        config.slot_count = slots;
    }
    if plugins.is_some() {
        config.plugins.directory = plugins;
    }
    if continue_on_fail {
        config.failure_policy = FailurePolicy::ContinueOnFail;
    }
    config.validate().map_err(anyhow::Error::msg)?;
    tracing_setup::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let controller = StationController::from_config(config)?.with_config_file(&config_path);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl+C received, stopping run");
            ctrl_c.cancel();
        }
    });

    let summary = controller.run(&cancel).await?;

    println!("Run {}", summary.run_id);
    println!(
        "  {} slot(s): {} passed, {} failed, {} stopped",
        summary.slot_count, summary.passed, summary.failed, summary.stopped
    );
    println!(
        "  Duration: {:.1}s",
        (summary.finished_at - summary.started_at).num_milliseconds() as f64 / 1000.0
    );

    if summary.failed > 0 || summary.stopped > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn list_steps(config_path: PathBuf) -> Result<()> {
    let config = StationConfig::load_from(&config_path)?;
    tracing_setup::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let registry = StepRegistry::discover(&config.plugins)?;
    for metadata in registry.metadata() {
        println!(
            "{:<24} {:<16} {}",
            metadata.step_id, metadata.category, metadata.name
        );
    }

    let unresolved: Vec<_> = config
        .step_plan
        .iter()
        .filter(|entry| !registry.contains(entry.step_id()))
        .collect();
    for entry in unresolved {
        println!("! plan entry {:?} does not match a registered step", entry.step_id());
    }
    Ok(())
}
