//! Segmented two-phase spike sorting driver
//!
//! Splits a long multichannel recording into contiguous segments, runs a
//! detection chain per segment, merges the results, clusters them globally,
//! then runs a fit chain per segment and reassembles the final firing table.
//! All numerical work is delegated to external processors.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Artifacts**: Run-scoped arena of temporary files with eager release
//! - **I/O**: `.mda` container codec and dataset header inspection
//! - **Processor**: Typed processor requests and the backends that run them
//! - **Pipeline**: Segment planning, bounded chain scheduling, merging and stage sequencing
//!
//! # Usage
//!
//! ```no_run
//! use segsort::{Config, run_pipeline};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_pipeline(config).await?;
//!     Ok(())
//! }
//! ```

pub mod artifacts;
pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod processor;

pub use artifacts::{Artifact, ArtifactRef, ArtifactStore, ReleaseSummary};
pub use config::Config;
pub use error::PipelineError;
pub use io::DatasetInfo;
pub use pipeline::{Metrics, PipelineDriver, RunPlan, RunReport, Segment, ThreadPlan};
pub use processor::{CommandBackend, ProcessorBackend, ProcessorRequest};

use anyhow::Result;
use std::sync::Arc;

/// Run the full pipeline, invoking processors as external commands.
pub async fn run_pipeline(config: Config) -> Result<RunReport> {
    let backend = Arc::new(CommandBackend::new(&config.processors));
    run_pipeline_with_backend(config, backend).await
}

/// Run the full pipeline against an arbitrary processor backend.
pub async fn run_pipeline_with_backend(
    config: Config,
    backend: Arc<dyn ProcessorBackend>,
) -> Result<RunReport> {
    tracing::info!("Starting segmented sorting pipeline");

    let metrics_output_path = config.processing.metrics_output_path.clone();
    let enable_metrics = config.processing.enable_metrics;
    let metrics_interval_secs = config.processing.metrics_interval_secs;

    let driver = PipelineDriver::new(config, backend)?;
    tracing::info!("Run plan: {} segments, {}", driver.plan().segments.len(), driver.plan().threads);

    let report = driver.run().await?;

    if enable_metrics {
        pipeline::MetricsReporter::new(driver.metrics().clone(), metrics_interval_secs).print_summary();
    }

    if let Some(path) = metrics_output_path {
        if let Err(e) = report.metrics.save_to_file(&path) {
            tracing::warn!("Failed to save metrics to {}: {}", path, e);
        }
    }

    tracing::info!("Pipeline complete: {}", report);

    Ok(report)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
