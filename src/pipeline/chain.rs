//! Per-segment step chains.
//!
//! A chain is an ordered list of steps built up front for one segment and
//! executed strictly in order. Detection and fit chains are built here and
//! run by the same [`SegmentStageRunner`](super::SegmentStageRunner).

use super::offsets::{self, EVENT_TIME_ROW, FIRING_TIME_ROW};
use super::planner::Segment;
use crate::artifacts::{
    Amplitudes, Artifact, ArtifactRef, ArtifactStore, EventTimes, Firings, Timeseries,
};
use crate::error::{PipelineError, Result};
use crate::pipeline::Metrics;
use crate::processor::{InvocationContext, Invoker, ProcessorRequest, SortingParams};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Which of the two segment phases a chain belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Detection,
    Fit,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Detection => f.write_str("detection"),
            Phase::Fit => f.write_str("fit"),
        }
    }
}

/// One step of a segment chain.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainStep {
    /// Call an external processor
    Invoke(ProcessorRequest),

    /// Copy a table, shifting its time row from local to global coordinates
    Globalize {
        input: ArtifactRef,
        output: ArtifactRef,
        row: usize,
        offset: u64,
    },

    /// Keep records with global time in `[t1, t2]`, localized to `t1`
    SliceLocal {
        input: ArtifactRef,
        output: ArtifactRef,
        t1: u64,
        t2: u64,
        row: usize,
    },

    /// Release a temporary whose last consumer has run
    Release(ArtifactRef),
}

impl ChainStep {
    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            ChainStep::Invoke(request) => request.processor_name(),
            ChainStep::Globalize { .. } => "globalize_times",
            ChainStep::SliceLocal { .. } => "slice_firings",
            ChainStep::Release(_) => "release",
        }
    }
}

/// Ordered steps for one segment in one phase.
#[derive(Debug, Clone)]
pub struct SegmentChain {
    pub segment: Segment,
    pub phase: Phase,
    pub steps: Vec<ChainStep>,
}

/// Artifacts a segment produces during detection.
#[derive(Debug, Clone)]
pub struct DetectionArtifacts {
    pub raw_slice: Artifact<Timeseries>,
    /// Retained until the segment's fit step
    pub filtered: Artifact<Timeseries>,
    pub local_event_times: Artifact<EventTimes>,
    pub event_times: Artifact<EventTimes>,
    pub amplitudes: Artifact<Amplitudes>,
}

impl DetectionArtifacts {
    pub fn allocate(store: &ArtifactStore, segment: &Segment) -> Result<Self> {
        let i = segment.index;
        Ok(Self {
            raw_slice: store.allocate(&format!("pre_segment_{}.mda", i))?,
            filtered: store.allocate(&format!("filt_segment_{}.mda", i))?,
            local_event_times: store.allocate(&format!("event_times_local_segment_{}.mda", i))?,
            event_times: store.allocate(&format!("event_times_segment_{}.mda", i))?,
            amplitudes: store.allocate(&format!("amplitudes_segment_{}.mda", i))?,
        })
    }
}

/// Artifacts a segment produces during fitting.
#[derive(Debug, Clone)]
pub struct FitArtifacts {
    pub local_firings: Artifact<Firings>,
    pub local_fit: Artifact<Firings>,
    pub firings: Artifact<Firings>,
}

impl FitArtifacts {
    pub fn allocate(store: &ArtifactStore, segment: &Segment) -> Result<Self> {
        let i = segment.index;
        Ok(Self {
            local_firings: store.allocate(&format!("firings_local_segment_{}.mda", i))?,
            local_fit: store.allocate(&format!("firings_fit_local_segment_{}.mda", i))?,
            firings: store.allocate(&format!("firings_fit_segment_{}.mda", i))?,
        })
    }
}

/// Extract, filter, detect, measure amplitudes, globalize event times.
pub fn detection_chain(
    segment: Segment,
    sources: &[Artifact<Timeseries>],
    artifacts: &DetectionArtifacts,
    params: &SortingParams,
    threads: usize,
) -> SegmentChain {
    let a = artifacts;
    let steps = vec![
        ChainStep::Invoke(ProcessorRequest::ExtractSegment {
            sources: sources.to_vec(),
            output: a.raw_slice.clone(),
            t1: segment.t1,
            t2: segment.t2,
        }),
        ChainStep::Invoke(ProcessorRequest::BandpassFilter {
            timeseries: a.raw_slice.clone(),
            output: a.filtered.clone(),
            params: params.filter,
            threads,
        }),
        ChainStep::Invoke(ProcessorRequest::DetectEvents {
            timeseries: a.filtered.clone(),
            output: a.local_event_times.clone(),
            params: params.detect,
            threads,
        }),
        ChainStep::Invoke(ProcessorRequest::ComputeAmplitudes {
            timeseries: a.filtered.clone(),
            event_times: a.local_event_times.clone(),
            output: a.amplitudes.clone(),
            central_channel: params.central_channel,
            threads,
        }),
        ChainStep::Globalize {
            input: a.local_event_times.handle().clone(),
            output: a.event_times.handle().clone(),
            row: EVENT_TIME_ROW,
            offset: segment.t1,
        },
        ChainStep::Release(a.raw_slice.handle().clone()),
        ChainStep::Release(a.local_event_times.handle().clone()),
    ];

    SegmentChain {
        segment,
        phase: Phase::Detection,
        steps,
    }
}

/// Slice the global firings to the segment, fit, globalize the result.
pub fn fit_chain(
    segment: Segment,
    firings: &Artifact<Firings>,
    filtered: &Artifact<Timeseries>,
    artifacts: &FitArtifacts,
) -> SegmentChain {
    let a = artifacts;
    let steps = vec![
        ChainStep::SliceLocal {
            input: firings.handle().clone(),
            output: a.local_firings.handle().clone(),
            t1: segment.t1,
            t2: segment.t2,
            row: FIRING_TIME_ROW,
        },
        ChainStep::Invoke(ProcessorRequest::FitStage {
            timeseries: filtered.clone(),
            firings: a.local_firings.clone(),
            output: a.local_fit.clone(),
        }),
        ChainStep::Globalize {
            input: a.local_fit.handle().clone(),
            output: a.firings.handle().clone(),
            row: FIRING_TIME_ROW,
            offset: segment.t1,
        },
        ChainStep::Release(a.local_firings.handle().clone()),
        ChainStep::Release(a.local_fit.handle().clone()),
        ChainStep::Release(filtered.handle().clone()),
    ];

    SegmentChain {
        segment,
        phase: Phase::Fit,
        steps,
    }
}

/// How a chain ended when no step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    Completed,
    /// The run was stopped with `remaining` steps not started
    Stopped { remaining: usize },
}

/// Shared state chains execute against.
pub struct ChainExecutor {
    invoker: Invoker,
    store: Arc<ArtifactStore>,
    metrics: Option<Arc<Metrics>>,
}

impl ChainExecutor {
    pub fn new(invoker: Invoker, store: Arc<ArtifactStore>, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            invoker,
            store,
            metrics,
        }
    }

    /// Run every step of `chain` in order, stopping at the first failure.
    ///
    /// `stop` is checked before each step; once it is set no further step
    /// starts. A step already in flight runs to completion.
    pub async fn run(&self, chain: &SegmentChain, stop: &AtomicBool) -> Result<ChainOutcome> {
        let context = InvocationContext::Segment(chain.segment.index);
        for (i, step) in chain.steps.iter().enumerate() {
            if stop.load(Ordering::Acquire) {
                let remaining = chain.steps.len() - i;
                tracing::debug!("[{}] stopped before {} ({} steps skipped)", context, step.name(), remaining);
                return Ok(ChainOutcome::Stopped { remaining });
            }
            self.run_step(step, context).await?;
        }
        Ok(ChainOutcome::Completed)
    }

    async fn run_step(&self, step: &ChainStep, context: InvocationContext) -> Result<()> {
        match step {
            ChainStep::Invoke(request) => self.invoker.invoke(request, context).await,
            ChainStep::Globalize {
                input,
                output,
                row,
                offset,
            } => {
                let (input, output) = (input.path().to_path_buf(), output.path().to_path_buf());
                let (row, offset) = (*row, *offset);
                self.builtin(step.name(), context, move || {
                    offsets::globalize_file(&input, &output, row, offset)
                })
                .await
            }
            ChainStep::SliceLocal {
                input,
                output,
                t1,
                t2,
                row,
            } => {
                let (input, output) = (input.path().to_path_buf(), output.path().to_path_buf());
                let (t1, t2, row) = (*t1, *t2, *row);
                self.builtin(step.name(), context, move || {
                    offsets::slice_local_file(&input, &output, t1, t2, row)
                })
                .await
            }
            ChainStep::Release(handle) => self
                .store
                .release(handle)
                .map(|_| ())
                .map_err(|e| PipelineError::invocation(step.name(), context.to_string(), e)),
        }
    }

    /// Run an in-process step on the blocking pool.
    async fn builtin<F>(&self, name: &'static str, context: InvocationContext, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<usize> + Send + 'static,
    {
        let start = Instant::now();
        let result = tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| PipelineError::invocation(name, context.to_string(), e))?;

        if let Some(ref m) = self.metrics {
            m.add_builtin_time(start.elapsed());
        }

        match result {
            Ok(records) => {
                tracing::trace!("[{}] {} wrote {} records", context, name, records);
                Ok(())
            }
            Err(e @ PipelineError::Invocation { .. }) => Err(e),
            Err(e) => Err(PipelineError::invocation(name, context.to_string(), e)),
        }
    }
}

/// Paths of the artifacts, for concatenation.
pub(crate) fn paths<K: crate::artifacts::ArtifactKind>(artifacts: &[Artifact<K>]) -> Vec<PathBuf> {
    artifacts.iter().map(|a| a.path().to_path_buf()).collect()
}
