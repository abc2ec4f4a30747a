//! Segment planning, scheduling and stage sequencing.

mod chain;
mod concat;
mod concurrency;
mod driver;
mod global;
mod metrics;
pub mod offsets;
mod planner;
mod runner;

#[cfg(test)]
mod driver_integration_tests;

pub use chain::{
    detection_chain, fit_chain, ChainExecutor, ChainOutcome, ChainStep, DetectionArtifacts, FitArtifacts, Phase,
    SegmentChain,
};
pub use concat::{concat_files, concat_tables};
pub use concurrency::{host_cores, ThreadPlan};
pub use driver::{stage_plan, InputMode, PipelineDriver, RunPlan, RunReport, Stage};
pub use global::GlobalStages;
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use planner::{plan_segments, segment_length, Segment};
pub use runner::{RunnerConfig, SegmentStageRunner};
