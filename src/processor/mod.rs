//! Processor invocation interface.
//!
//! Every numerical step of the workflow runs in an external processor. The
//! pipeline describes each call as a typed [`ProcessorRequest`]; requests are
//! lowered to a generic [`StageStep`] (name, inputs, outputs, parameters)
//! only when handed to a [`ProcessorBackend`].

mod command;
#[cfg(test)]
pub(crate) mod fake;

pub use command::CommandBackend;

use crate::artifacts::{
    Amplitudes, Artifact, ArtifactKind, Clips, ClusterMetrics, EventTimes, Firings, Labels,
    Timeseries, WhiteningMatrix,
};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::pipeline::Metrics;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Reserved parameter asking a processor to use a given number of threads.
pub const REQUEST_THREADS_PARAM: &str = "_request_num_threads";

/// Scalar parameter value passed to a processor.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

/// Generic description of one processor invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StageStep {
    pub processor: &'static str,
    pub inputs: BTreeMap<&'static str, Vec<PathBuf>>,
    pub outputs: BTreeMap<&'static str, PathBuf>,
    pub params: BTreeMap<&'static str, ParamValue>,
}

impl StageStep {
    fn new(processor: &'static str) -> Self {
        Self {
            processor,
            ..Default::default()
        }
    }

    fn input<K: ArtifactKind>(mut self, name: &'static str, artifact: &Artifact<K>) -> Self {
        self.inputs.insert(name, vec![artifact.path().to_path_buf()]);
        self
    }

    fn input_list<K: ArtifactKind>(mut self, name: &'static str, artifacts: &[Artifact<K>]) -> Self {
        self.inputs
            .insert(name, artifacts.iter().map(|a| a.path().to_path_buf()).collect());
        self
    }

    fn output<K: ArtifactKind>(mut self, name: &'static str, artifact: &Artifact<K>) -> Self {
        self.outputs.insert(name, artifact.path().to_path_buf());
        self
    }

    fn param(mut self, name: &'static str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name, value.into());
        self
    }

    fn threads(self, threads: usize) -> Self {
        self.param(REQUEST_THREADS_PARAM, threads)
    }

    /// First path of a named input.
    pub fn input_path(&self, name: &str) -> Option<&PathBuf> {
        self.inputs.get(name).and_then(|paths| paths.first())
    }
}

/// Bandpass filter settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterParams {
    pub sample_rate: f64,
    pub freq_min: f64,
    pub freq_max: f64,
    pub freq_wid: f64,
}

/// Event detection settings, with the interval already in samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    pub central_channel: usize,
    pub threshold: f64,
    pub interval: u64,
    pub sign: i32,
    pub subsample_factor: u32,
}

/// Processor settings shared by every request of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortingParams {
    pub filter: FilterParams,
    pub detect: DetectParams,
    pub central_channel: usize,
    pub clip_size: u64,
    pub sample_rate: f64,
}

impl SortingParams {
    pub fn from_config(config: &Config) -> Self {
        let signal = &config.signal;
        Self {
            filter: FilterParams {
                sample_rate: signal.sample_rate,
                freq_min: signal.freq_min,
                freq_max: signal.freq_max,
                freq_wid: signal.freq_wid,
            },
            detect: DetectParams {
                central_channel: signal.central_channel,
                threshold: config.detection.threshold,
                interval: config.detect_interval_samples(),
                sign: config.detection.sign,
                subsample_factor: config.detection.subsample_factor,
            },
            central_channel: signal.central_channel,
            clip_size: config.clip_size_samples(),
            sample_rate: signal.sample_rate,
        }
    }
}

/// One typed processor call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorRequest {
    ExtractSegment {
        sources: Vec<Artifact<Timeseries>>,
        output: Artifact<Timeseries>,
        t1: u64,
        t2: u64,
    },
    BandpassFilter {
        timeseries: Artifact<Timeseries>,
        output: Artifact<Timeseries>,
        params: FilterParams,
        threads: usize,
    },
    DetectEvents {
        timeseries: Artifact<Timeseries>,
        output: Artifact<EventTimes>,
        params: DetectParams,
        threads: usize,
    },
    ComputeAmplitudes {
        timeseries: Artifact<Timeseries>,
        event_times: Artifact<EventTimes>,
        output: Artifact<Amplitudes>,
        central_channel: usize,
        threads: usize,
    },
    ExtractClips {
        timeseries: Vec<Artifact<Timeseries>>,
        event_times: Artifact<EventTimes>,
        output: Artifact<Clips>,
        clip_size: u64,
    },
    ComputeWhiteningMatrix {
        timeseries: Vec<Artifact<Timeseries>>,
        output: Artifact<WhiteningMatrix>,
        threads: usize,
    },
    WhitenClips {
        clips: Artifact<Clips>,
        whitening_matrix: Artifact<WhiteningMatrix>,
        output: Artifact<Clips>,
        threads: usize,
    },
    SortClips {
        clips: Artifact<Clips>,
        output: Artifact<Labels>,
        threads: usize,
    },
    CreateFirings {
        event_times: Artifact<EventTimes>,
        labels: Artifact<Labels>,
        amplitudes: Option<Artifact<Amplitudes>>,
        output: Artifact<Firings>,
        central_channel: usize,
    },
    FitStage {
        timeseries: Artifact<Timeseries>,
        firings: Artifact<Firings>,
        output: Artifact<Firings>,
    },
    ClusterMetrics {
        timeseries: Vec<Artifact<Timeseries>>,
        firings: Artifact<Firings>,
        output: Artifact<ClusterMetrics>,
        sample_rate: f64,
    },
}

impl ProcessorRequest {
    /// Name of the external processor.
    pub fn processor_name(&self) -> &'static str {
        match self {
            Self::ExtractSegment { .. } => "extract_segment_timeseries",
            Self::BandpassFilter { .. } => "bandpass_filter",
            Self::DetectEvents { .. } => "detect_events",
            Self::ComputeAmplitudes { .. } => "compute_amplitudes",
            Self::ExtractClips { .. } => "extract_clips",
            Self::ComputeWhiteningMatrix { .. } => "compute_whitening_matrix",
            Self::WhitenClips { .. } => "whiten_clips",
            Self::SortClips { .. } => "sort_clips",
            Self::CreateFirings { .. } => "create_firings",
            Self::FitStage { .. } => "fit_stage",
            Self::ClusterMetrics { .. } => "cluster_metrics",
        }
    }

    /// Lower to the generic step handed to a backend.
    pub fn to_step(&self) -> StageStep {
        let step = StageStep::new(self.processor_name());
        match self {
            Self::ExtractSegment { sources, output, t1, t2 } => step
                .input_list("timeseries", sources)
                .output("timeseries_out", output)
                .param("t1", *t1)
                .param("t2", *t2),
            Self::BandpassFilter { timeseries, output, params, threads } => step
                .input("timeseries", timeseries)
                .output("timeseries_out", output)
                .param("samplerate", params.sample_rate)
                .param("freq_min", params.freq_min)
                .param("freq_max", params.freq_max)
                .param("freq_wid", params.freq_wid)
                .threads(*threads),
            Self::DetectEvents { timeseries, output, params, threads } => step
                .input("timeseries", timeseries)
                .output("event_times_out", output)
                .param("central_channel", params.central_channel)
                .param("detect_threshold", params.threshold)
                .param("detect_interval", params.interval)
                .param("sign", params.sign)
                .param("subsample_factor", params.subsample_factor)
                .threads(*threads),
            Self::ComputeAmplitudes { timeseries, event_times, output, central_channel, threads } => step
                .input("timeseries", timeseries)
                .input("event_times", event_times)
                .output("amplitudes_out", output)
                .param("central_channel", *central_channel)
                .threads(*threads),
            Self::ExtractClips { timeseries, event_times, output, clip_size } => step
                .input_list("timeseries", timeseries)
                .input("event_times", event_times)
                .output("clips_out", output)
                .param("clip_size", *clip_size),
            Self::ComputeWhiteningMatrix { timeseries, output, threads } => step
                .input_list("timeseries_list", timeseries)
                .output("whitening_matrix_out", output)
                .threads(*threads),
            Self::WhitenClips { clips, whitening_matrix, output, threads } => step
                .input("clips", clips)
                .input("whitening_matrix", whitening_matrix)
                .output("clips_out", output)
                .threads(*threads),
            Self::SortClips { clips, output, threads } => step
                .input("clips", clips)
                .output("labels_out", output)
                .threads(*threads),
            Self::CreateFirings { event_times, labels, amplitudes, output, central_channel } => {
                let step = step
                    .input("event_times", event_times)
                    .input("labels", labels)
                    .output("firings_out", output)
                    .param("central_channel", *central_channel);
                match amplitudes {
                    Some(amplitudes) => step.input("amplitudes", amplitudes),
                    None => step,
                }
            }
            Self::FitStage { timeseries, firings, output } => step
                .input("timeseries", timeseries)
                .input("firings", firings)
                .output("firings_out", output),
            Self::ClusterMetrics { timeseries, firings, output, sample_rate } => step
                .input_list("timeseries", timeseries)
                .input("firings", firings)
                .output("cluster_metrics_out", output)
                .param("samplerate", *sample_rate),
        }
    }
}

/// Where an invocation was issued from, for logs and errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationContext {
    Segment(usize),
    Global,
}

impl fmt::Display for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationContext::Segment(i) => write!(f, "segment {}", i),
            InvocationContext::Global => f.write_str("global"),
        }
    }
}

/// Executes lowered processor steps.
///
/// Completion means every declared output has been written.
pub trait ProcessorBackend: Send + Sync {
    fn invoke<'a>(&'a self, step: &'a StageStep) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Issues requests to a backend, with logging, timing and failure context.
#[derive(Clone)]
pub struct Invoker {
    backend: Arc<dyn ProcessorBackend>,
    metrics: Option<Arc<Metrics>>,
}

impl Invoker {
    pub fn new(backend: Arc<dyn ProcessorBackend>, metrics: Option<Arc<Metrics>>) -> Self {
        Self { backend, metrics }
    }

    /// Run one request to completion.
    pub async fn invoke(&self, request: &ProcessorRequest, context: InvocationContext) -> Result<()> {
        let step = request.to_step();
        tracing::debug!("[{}] invoking {}", context, step.processor);

        if let Some(ref m) = self.metrics {
            m.add_invocation();
        }

        let start = Instant::now();
        let result = self.backend.invoke(&step).await;
        let elapsed = start.elapsed();

        if let Some(ref m) = self.metrics {
            m.add_processor_time(elapsed);
        }

        match result {
            Ok(()) => {
                tracing::debug!(
                    "[{}] {} finished in {:.2}s",
                    context,
                    step.processor,
                    elapsed.as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                if let Some(ref m) = self.metrics {
                    m.add_invocation_failure();
                }
                Err(PipelineError::invocation(
                    step.processor,
                    context.to_string(),
                    format!("{:#}", e),
                ))
            }
        }
    }
}
