//! segsort CLI
//!
//! Runs the segmented sorting pipeline from a configuration file.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use segsort::{build_runtime, run_pipeline, Config, RunPlan};

#[derive(Parser)]
#[command(name = "segsort")]
#[command(about = "Segmented two-phase spike sorting driver", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override the number of segments processed concurrently
    #[arg(long, global = true)]
    parallelism: Option<usize>,

    /// Override the thread count requested from each processor
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Print the dataset, segment and thread plan without running processors
    Plan,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let overrides = Overrides {
        parallelism: cli.parallelism,
        threads: cli.threads,
    };

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(cli.config, overrides)?;
        }

        Some(Commands::Plan) => {
            plan_command(cli.config, overrides)?;
        }

        Some(Commands::Validate) => {
            validate_command(cli.config, overrides)?;
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

/// Command-line overrides applied on top of the configuration file.
struct Overrides {
    parallelism: Option<usize>,
    threads: Option<usize>,
}

fn load_config(config_path: &PathBuf, overrides: &Overrides) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;

    if let Some(p) = overrides.parallelism {
        config.processing.intra_segment_parallelism = p;
    }
    if let Some(t) = overrides.threads {
        config.processing.inter_segment_threads = Some(t);
    }

    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, overrides: Overrides) -> Result<()> {
    let config = load_config(&config_path, &overrides)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async { run_pipeline(config).await })?;

    Ok(())
}

fn plan_command(config_path: PathBuf, overrides: Overrides) -> Result<()> {
    let config = load_config(&config_path, &overrides)?;
    let plan = RunPlan::from_config(&config)?;

    println!("\n=== Run Plan ===");
    print!("{}", plan);
    println!("================\n");

    Ok(())
}

fn validate_command(config_path: PathBuf, overrides: Overrides) -> Result<()> {
    load_config(&config_path, &overrides)?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# segsort configuration

# === INPUT ===
input:
  # Raw timeseries: one .mda file, or a list concatenated along time
  raw: "raw.mda"
  # raw: ["raw_part1.mda", "raw_part2.mda"]

  # Alternatively, skip detection and sort precomputed clips
  # clips: "clips.mda"
  # event_times: "event_times.mda"
  # amplitudes: "amplitudes.mda"

# === OUTPUT ===
output:
  firings: "firings.mda"

  # Cluster metrics are only computed when a destination is set
  # cluster_metrics: "cluster_metrics.mda"

# === SIGNAL ===
signal:
  sample_rate: 30000
  central_channel: 0
  freq_min: 300
  freq_max: 6000
  freq_wid: 1000

# === DETECTION ===
detection:
  threshold: 3.0
  interval_msec: 1.0
  # -1 negative, 1 positive, 0 both
  sign: 0
  subsample_factor: 1

# === CLUSTERING ===
clustering:
  clip_size_msec: 1.5

# === PROCESSING ===
processing:
  # Length of each segment in seconds
  segment_duration_sec: 600

  # Segments processed concurrently
  intra_segment_parallelism: 1

  # Threads requested from each processor
  # (default: all cores when segments run one at a time, else 1)
  # inter_segment_threads: 8

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Print progress during segment phases
  enable_metrics: true
  metrics_interval_secs: 10

  # metrics_output_path: "metrics.json"

# === TEMPORARIES ===
temp:
  dir: "/tmp/segsort"
  prefix: "00"

# === PROCESSORS ===
processors:
  executable: "mp-run-process"
  namespace: "mountainsort"
  args: []
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
