//! Run metrics and periodic progress reporting.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for one pipeline run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Number of planned segments
    pub total_segments: AtomicU64,

    /// Segments whose detection chain completed
    pub segments_detected: AtomicU64,

    /// Segments whose fit chain completed
    pub segments_fit: AtomicU64,

    /// Processor invocations issued
    pub invocations: AtomicU64,

    /// Processor invocations that failed
    pub invocation_failures: AtomicU64,

    /// Temporary artifacts allocated
    pub artifacts_allocated: AtomicU64,

    /// Temporary artifacts released
    pub artifacts_released: AtomicU64,

    /// Records written by the concatenator
    pub records_merged: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    /// Time spent inside external processors (microseconds, summed across tasks)
    pub processor_us: AtomicU64,

    /// Time spent in builtin steps (microseconds, summed across tasks)
    pub builtin_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn set_total_segments(&self, count: u64) {
        self.total_segments.store(count, Ordering::Relaxed);
    }

    pub fn add_segment_detected(&self) {
        self.segments_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_segment_fit(&self) {
        self.segments_fit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_invocation_failure(&self) {
        self.invocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_artifact_allocated(&self) {
        self.artifacts_allocated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_artifact_released(&self) {
        self.artifacts_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_records_merged(&self, count: u64) {
        self.records_merged.fetch_add(count, Ordering::Relaxed);
    }

    /// Record time spent in an external processor.
    pub fn add_processor_time(&self, duration: Duration) {
        self.processor_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent in a builtin step.
    pub fn add_builtin_time(&self, duration: Duration) {
        self.builtin_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Fraction of segment chains completed across both phases, in percent.
    pub fn progress_percent(&self) -> f64 {
        let total = self.total_segments.load(Ordering::Relaxed) * 2;
        if total == 0 {
            return 0.0;
        }
        let done = self.segments_detected.load(Ordering::Relaxed)
            + self.segments_fit.load(Ordering::Relaxed);
        done as f64 / total as f64 * 100.0
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_segments: self.total_segments.load(Ordering::Relaxed),
            segments_detected: self.segments_detected.load(Ordering::Relaxed),
            segments_fit: self.segments_fit.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            invocation_failures: self.invocation_failures.load(Ordering::Relaxed),
            artifacts_allocated: self.artifacts_allocated.load(Ordering::Relaxed),
            artifacts_released: self.artifacts_released.load(Ordering::Relaxed),
            records_merged: self.records_merged.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            processor_secs: self.processor_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            builtin_secs: self.builtin_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_segments: u64,
    pub segments_detected: u64,
    pub segments_fit: u64,
    pub invocations: u64,
    pub invocation_failures: u64,
    pub artifacts_allocated: u64,
    pub artifacts_released: u64,
    pub records_merged: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    /// Total time inside external processors (seconds, summed across tasks)
    pub processor_secs: f64,
    /// Total time in builtin steps (seconds, summed across tasks)
    pub builtin_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    /// Artifacts still live when the snapshot was taken.
    pub fn artifacts_live(&self) -> u64 {
        self.artifacts_allocated.saturating_sub(self.artifacts_released)
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Segments: {}/{} detected, {}/{} fit | Invocations: {} ({} failed) | \
             Artifacts: {} live | Merged: {} records | \
             Processor {:.1}s | Builtin {:.1}s | Elapsed: {:.1}s",
            self.segments_detected,
            self.total_segments,
            self.segments_fit,
            self.total_segments,
            self.invocations,
            self.invocation_failures,
            self.artifacts_live(),
            self.records_merged,
            self.processor_secs,
            self.builtin_secs,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs: interval_secs.max(1),
        }
    }

    /// Log progress every interval until shutdown is signalled.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("[{:.1}%] {}", self.metrics.progress_percent(), snapshot);
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Segments: {}", snapshot.total_segments);
        println!("Detection chains completed: {}", snapshot.segments_detected);
        println!("Fit chains completed: {}", snapshot.segments_fit);
        println!("Processor invocations: {}", snapshot.invocations);
        println!("Invocation failures: {}", snapshot.invocation_failures);
        println!("Records merged: {}", snapshot.records_merged);
        println!(
            "Temporaries: {} allocated, {} released",
            snapshot.artifacts_allocated, snapshot.artifacts_released
        );

        let total = snapshot.processor_secs + snapshot.builtin_secs;
        if total > 0.0 {
            println!("\n--- Time Breakdown ---");
            println!("Processors: {:>7.1}s ({:>5.1}%)", snapshot.processor_secs, snapshot.processor_secs / total * 100.0);
            println!("Builtin:    {:>7.1}s ({:>5.1}%)", snapshot.builtin_secs, snapshot.builtin_secs / total * 100.0);
        }
        println!("========================\n");
    }
}
