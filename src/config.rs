//! Configuration for the segmented sorting pipeline.

use crate::error::PipelineError;
use crate::pipeline::segment_length;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input artifacts
    pub input: InputConfig,

    /// Output destinations
    pub output: OutputConfig,

    /// Signal parameters shared by all stages
    pub signal: SignalConfig,

    /// Event detection parameters
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Clip extraction and clustering parameters
    #[serde(default)]
    pub clustering: ClusteringConfig,

    /// Segmentation and concurrency
    pub processing: ProcessingConfig,

    /// Temporary artifact location
    pub temp: TempConfig,

    /// External processor backend
    #[serde(default)]
    pub processors: ProcessorsConfig,
}

/// One path or an ordered list of paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceList {
    One(PathBuf),
    Many(Vec<PathBuf>),
}

impl SourceList {
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            SourceList::One(path) => vec![path.clone()],
            SourceList::Many(paths) => paths.clone(),
        }
    }
}

impl Default for SourceList {
    fn default() -> Self {
        SourceList::Many(Vec::new())
    }
}

/// Input artifact configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    /// Raw time series: one file or a list treated as a time-axis concatenation
    #[serde(default)]
    pub raw: SourceList,

    /// Precomputed clips (used with `event_times` when no raw source is given)
    #[serde(default)]
    pub clips: Option<PathBuf>,

    /// Precomputed global event times matching `clips`
    #[serde(default)]
    pub event_times: Option<PathBuf>,

    /// Precomputed amplitudes matching `event_times`
    #[serde(default)]
    pub amplitudes: Option<PathBuf>,
}

impl InputConfig {
    /// Raw source paths, in concatenation order.
    pub fn raw_sources(&self) -> Vec<PathBuf> {
        self.raw.paths()
    }

    /// Whether the segmented raw path applies.
    pub fn has_raw(&self) -> bool {
        !self.raw_sources().is_empty()
    }
}

/// Output destinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Destination of the final firing table
    #[serde(default)]
    pub firings: PathBuf,

    /// Destination of cluster metrics; metrics are skipped when unset
    #[serde(default)]
    pub cluster_metrics: Option<PathBuf>,
}

/// Signal parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Sample rate in Hz (required)
    #[serde(default)]
    pub sample_rate: f64,

    /// Channel used as detection and amplitude reference
    #[serde(default)]
    pub central_channel: usize,

    /// Bandpass lower edge in Hz
    #[serde(default)]
    pub freq_min: f64,

    /// Bandpass upper edge in Hz
    #[serde(default)]
    pub freq_max: f64,

    /// Bandpass roll-off width in Hz
    #[serde(default)]
    pub freq_wid: f64,
}

/// Event detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Detection threshold
    #[serde(default = "default_detect_threshold")]
    pub threshold: f64,

    /// Minimum interval between events in milliseconds
    #[serde(default = "default_detect_interval_msec")]
    pub interval_msec: f64,

    /// Polarity: -1 negative, 1 positive, 0 both
    #[serde(default)]
    pub sign: i32,

    /// Subsampling of detected events
    #[serde(default = "default_subsample_factor")]
    pub subsample_factor: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: default_detect_threshold(),
            interval_msec: default_detect_interval_msec(),
            sign: 0,
            subsample_factor: default_subsample_factor(),
        }
    }
}

/// Clip extraction and clustering parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusteringConfig {
    /// Clip window in milliseconds (required)
    #[serde(default)]
    pub clip_size_msec: f64,
}

/// Segmentation and concurrency configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Segment duration in seconds (required)
    #[serde(default)]
    pub segment_duration_sec: f64,

    /// Number of segment chains running concurrently
    #[serde(default = "default_intra_segment_parallelism")]
    pub intra_segment_parallelism: usize,

    /// Thread count requested from each processor invocation.
    /// Unset (or 0) derives it from `intra_segment_parallelism`.
    #[serde(default)]
    pub inter_segment_threads: Option<usize>,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            segment_duration_sec: 0.0,
            intra_segment_parallelism: default_intra_segment_parallelism(),
            inter_segment_threads: None,
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Temporary artifact location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempConfig {
    /// Directory for temporaries (required)
    #[serde(default)]
    pub dir: PathBuf,

    /// Filename prefix for temporaries
    #[serde(default = "default_temp_prefix")]
    pub prefix: String,
}

impl Default for TempConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            prefix: default_temp_prefix(),
        }
    }
}

/// External processor backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorsConfig {
    /// Executable that runs one named processor per call
    #[serde(default = "default_executable")]
    pub executable: String,

    /// Namespace prepended to processor names (`<namespace>.<name>`)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Extra arguments placed before the processor name
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ProcessorsConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            namespace: default_namespace(),
            args: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration. Runs before any work is scheduled.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(self.signal.sample_rate > 0.0) {
            return Err(PipelineError::config("signal.sample_rate must be present and > 0"));
        }
        if !(self.processing.segment_duration_sec > 0.0) {
            return Err(PipelineError::config(
                "processing.segment_duration_sec must be present and > 0",
            ));
        }
        if !(self.clustering.clip_size_msec > 0.0) {
            return Err(PipelineError::config(
                "clustering.clip_size_msec must be present and > 0",
            ));
        }
        if self.processing.intra_segment_parallelism == 0 {
            return Err(PipelineError::config(
                "processing.intra_segment_parallelism must be > 0",
            ));
        }
        if self.temp.dir.as_os_str().is_empty() {
            return Err(PipelineError::config("temp.dir must be set"));
        }
        if self.output.firings.as_os_str().is_empty() {
            return Err(PipelineError::config("output.firings must be set"));
        }
        if self.detection.subsample_factor == 0 {
            return Err(PipelineError::config("detection.subsample_factor must be > 0"));
        }

        let precomputed = self.input.clips.is_some() && self.input.event_times.is_some();
        if !self.input.has_raw() && !precomputed {
            return Err(PipelineError::config(
                "input.raw must be set, or both input.clips and input.event_times",
            ));
        }
        Ok(())
    }

    /// Segment length in samples: `ceil(segment_duration_sec * sample_rate)`.
    pub fn segment_samples(&self) -> u64 {
        segment_length(self.processing.segment_duration_sec, self.signal.sample_rate)
    }

    /// Clip window in samples: `ceil(clip_size_msec / 1000 * sample_rate)`.
    pub fn clip_size_samples(&self) -> u64 {
        segment_length(self.clustering.clip_size_msec / 1000.0, self.signal.sample_rate)
    }

    /// Minimum detection interval in samples.
    pub fn detect_interval_samples(&self) -> u64 {
        segment_length(self.detection.interval_msec / 1000.0, self.signal.sample_rate)
    }
}

// Default value functions for serde
fn default_detect_threshold() -> f64 { 3.0 }
fn default_detect_interval_msec() -> f64 { 1.0 }
fn default_subsample_factor() -> u32 { 1 }
fn default_intra_segment_parallelism() -> usize { 1 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_temp_prefix() -> String { "00".to_string() }
fn default_executable() -> String { "mp-run-process".to_string() }
fn default_namespace() -> String { "mountainsort".to_string() }
