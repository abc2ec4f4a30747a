//! Bounded worker pool for segment chains.

use super::chain::{ChainExecutor, ChainOutcome, Phase, SegmentChain};
use super::metrics::{Metrics, MetricsReporter};
use crate::error::{PipelineError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Chains running concurrently
    pub segment_parallelism: usize,

    /// Log progress periodically while the phase runs
    pub enable_metrics: bool,

    /// Progress interval in seconds
    pub metrics_interval_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            segment_parallelism: 1,
            enable_metrics: false,
            metrics_interval_secs: 10,
        }
    }
}

/// Runs one phase worth of segment chains, `segment_parallelism` at a time.
pub struct SegmentStageRunner {
    executor: Arc<ChainExecutor>,
    metrics: Arc<Metrics>,
    config: RunnerConfig,
}

impl SegmentStageRunner {
    pub fn new(executor: Arc<ChainExecutor>, metrics: Arc<Metrics>, config: RunnerConfig) -> Self {
        Self {
            executor,
            metrics,
            config,
        }
    }

    /// Run every chain to completion or stop at the first failure.
    ///
    /// Chains are queued in segment order. Once a chain fails no worker takes
    /// another one and running chains start no further step; an invocation
    /// already in flight finishes. The first error is returned.
    pub async fn run(&self, chains: Vec<SegmentChain>) -> Result<()> {
        let Some(phase) = chains.first().map(|c| c.phase) else {
            return Ok(());
        };
        let workers = self.config.segment_parallelism.max(1).min(chains.len());
        tracing::info!(
            "Running {} {} chains with {} workers",
            chains.len(),
            phase,
            workers
        );

        // Progress reporting for the duration of the phase
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(self.metrics.clone(), self.config.metrics_interval_secs);
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            None
        };

        // Create a shared work queue
        let (work_tx, work_rx) = async_channel::bounded::<SegmentChain>(chains.len());
        for chain in chains {
            let _ = work_tx.send(chain).await;
        }
        work_tx.close();

        let aborted = Arc::new(AtomicBool::new(false));
        let first_error: Arc<Mutex<Option<PipelineError>>> = Arc::new(Mutex::new(None));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let executor = self.executor.clone();
            let metrics = self.metrics.clone();
            let work_rx = work_rx.clone();
            let aborted = aborted.clone();
            let first_error = first_error.clone();

            let handle = tokio::spawn(async move {
                // Process chains sequentially from the shared queue
                while !aborted.load(Ordering::Acquire) {
                    let Ok(chain) = work_rx.recv().await else {
                        break;
                    };
                    if aborted.load(Ordering::Acquire) {
                        break;
                    }

                    let start = Instant::now();
                    tracing::info!("[{}] {} started", chain.phase, chain.segment);

                    match executor.run(&chain, &aborted).await {
                        Ok(ChainOutcome::Stopped { remaining }) => {
                            tracing::warn!(
                                "[{}] {} abandoned with {} steps left",
                                chain.phase,
                                chain.segment,
                                remaining
                            );
                            break;
                        }
                        Ok(ChainOutcome::Completed) => {
                            match chain.phase {
                                Phase::Detection => metrics.add_segment_detected(),
                                Phase::Fit => metrics.add_segment_fit(),
                            }
                            tracing::info!(
                                "[{}] {} finished in {:.1}s",
                                chain.phase,
                                chain.segment,
                                start.elapsed().as_secs_f64()
                            );
                        }
                        Err(e) => {
                            tracing::error!("[{}] {} failed: {}", chain.phase, chain.segment, e);
                            aborted.store(true, Ordering::Release);
                            if let Ok(mut slot) = first_error.lock() {
                                slot.get_or_insert(e);
                            }
                            break;
                        }
                    }
                }
            });

            handles.push(handle);
        }

        // Wait for all workers to complete
        let mut panicked = None;
        for handle in handles {
            if let Err(e) = handle.await {
                panicked.get_or_insert(e);
            }
        }

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        let error = first_error.lock().ok().and_then(|mut slot| slot.take());
        if let Some(e) = error {
            return Err(e);
        }
        if let Some(e) = panicked {
            return Err(PipelineError::invocation(
                "segment worker",
                phase.to_string(),
                e,
            ));
        }
        Ok(())
    }
}
