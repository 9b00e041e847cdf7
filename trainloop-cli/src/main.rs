//! trainloop CLI: run config-defined experiments on synthetic regression data.

mod synthetic;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use synthetic::{DataConfig, Regression};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use trainloop_core::config::{config_figment, load_config};
use trainloop_core::persistence::atomic_write_json;
use trainloop_core::{DeviceCapabilities, Runner, RunnerConfig, SupervisedExperiment};

/// Staged training-loop runner
#[derive(Parser, Debug)]
#[command(name = "trainloop", version, about, long_about = None)]
struct Cli {
    /// Run file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSON traces to this directory
    #[arg(long, global = true)]
    trace_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run every stage of the configured experiment
    Run {
        /// Override the run's logdir
        #[arg(long)]
        logdir: Option<PathBuf>,

        /// Override the number of available accelerators
        #[arg(long)]
        accelerators: Option<usize>,
    },
    /// Print the fully layered configuration as TOML
    ShowConfig,
}

/// Sections of the run file that only the CLI reads.
#[derive(Debug, Default, Deserialize)]
struct CliSections {
    #[serde(default)]
    data: DataConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(&cli);

    match cli.command {
        Commands::Run {
            logdir,
            accelerators,
        } => run(cli.config.as_deref(), logdir, accelerators).await,
        Commands::ShowConfig => {
            let config = load_config(cli.config.as_deref(), &[])
                .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Human-readable stderr, plus JSON file logging when `--trace-dir` is given.
fn init_tracing(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    let (json_layer, guard) = match &cli.trace_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "trainloop.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    guard
}

async fn run(
    path: Option<&Path>,
    logdir: Option<PathBuf>,
    accelerators: Option<usize>,
) -> anyhow::Result<()> {
    let mut overrides = Vec::new();
    if let Some(logdir) = &logdir {
        overrides.push(("logdir", json!(logdir)));
    }
    if let Some(count) = accelerators {
        overrides.push(("num_accelerators", json!(count)));
    }
    let config: RunnerConfig = load_config(path, &overrides)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let sections: CliSections = config_figment(path, &overrides)
        .extract()
        .map_err(|e| anyhow::anyhow!("Invalid [data] section: {}", e))?;

    let capabilities = config
        .num_accelerators
        .map(DeviceCapabilities::with_accelerators)
        .unwrap_or_else(DeviceCapabilities::from_env);
    info!(
        logdir = %config.logdir.display(),
        accelerators = capabilities.accelerator_count,
        stages = config.stages.len(),
        "Starting run"
    );

    let data = Regression::new(sections.data);
    let logdir = config.logdir.clone();
    let experiment = SupervisedExperiment::new(config, move |_stage: &str| data.loaders())?;
    let mut runner = Runner::new(experiment, capabilities);
    let summary = runner.run().await?;

    let summary_path = logdir.join("summary.json");
    atomic_write_json(&summary_path, &summary)
        .with_context(|| format!("writing {}", summary_path.display()))?;

    println!("run {}", summary.run_id);
    for stage in &summary.stages {
        match &stage.best {
            Some(best) => println!(
                "  {:<16} epochs {:>3}  best {}/{} = {:.6} (epoch {})",
                stage.name, stage.epochs_completed, best.loader_key, best.metric_key, best.value, best.epoch
            ),
            None => println!("  {:<16} epochs {:>3}", stage.name, stage.epochs_completed),
        }
    }
    if summary.stopped_early {
        println!("  stopped early");
    }
    println!("  summary written to {}", summary_path.display());
    Ok(())
}
