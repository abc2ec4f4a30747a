//! Top-level sequencing of a sorting run.
//!
//! The driver plans segments, runs the detection phase, merges its results,
//! runs the global stages, runs the fit phase, merges again and writes the
//! output. Every stage is timed and logged; the first failure stops the run
//! and all temporaries are released before the error is returned.

use super::chain::{detection_chain, fit_chain, paths, ChainExecutor, DetectionArtifacts, FitArtifacts};
use super::concat::concat_files;
use super::concurrency::{host_cores, ThreadPlan};
use super::global::GlobalStages;
use super::metrics::{Metrics, MetricsSnapshot};
use super::planner::{plan_segments, Segment};
use super::runner::{RunnerConfig, SegmentStageRunner};
use crate::artifacts::{
    Amplitudes, Artifact, ArtifactKind, ArtifactStore, Clips, ClusterMetrics, EventTimes, Firings,
    Labels, Timeseries, WhiteningMatrix,
};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::io::DatasetInfo;
use crate::processor::{Invoker, ProcessorBackend, SortingParams};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Top-level stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PlanSegments,
    DetectSegments,
    MergeEventTimes,
    MergeAmplitudes,
    ExtractClips,
    WhiteningMatrix,
    WhitenClips,
    SortClips,
    CreateFirings,
    FitSegments,
    MergeFirings,
    ClusterMetrics,
    WriteOutput,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::PlanSegments => "Reading dataset info and planning segments",
            Stage::DetectSegments => "Detecting events per segment",
            Stage::MergeEventTimes => "Combining event times",
            Stage::MergeAmplitudes => "Combining amplitudes",
            Stage::ExtractClips => "Extracting clips",
            Stage::WhiteningMatrix => "Computing whitening matrix",
            Stage::WhitenClips => "Whitening clips",
            Stage::SortClips => "Sorting clips",
            Stage::CreateFirings => "Creating firings",
            Stage::FitSegments => "Fitting segments",
            Stage::MergeFirings => "Combining firings",
            Stage::ClusterMetrics => "Computing cluster metrics",
            Stage::WriteOutput => "Writing output",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Where the clips come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Segmented detection and fitting over raw sources
    Raw,
    /// Clips and event times supplied by the user
    PrecomputedClips,
}

impl InputMode {
    pub fn from_config(config: &Config) -> Self {
        if config.input.has_raw() {
            InputMode::Raw
        } else {
            InputMode::PrecomputedClips
        }
    }
}

/// Stages a run will execute.
pub fn stage_plan(mode: InputMode, cluster_metrics: bool) -> Vec<Stage> {
    match mode {
        InputMode::Raw => {
            let mut stages = vec![
                Stage::PlanSegments,
                Stage::DetectSegments,
                Stage::MergeEventTimes,
                Stage::MergeAmplitudes,
                Stage::ExtractClips,
                Stage::WhiteningMatrix,
                Stage::WhitenClips,
                Stage::SortClips,
                Stage::CreateFirings,
                Stage::FitSegments,
                Stage::MergeFirings,
            ];
            if cluster_metrics {
                stages.push(Stage::ClusterMetrics);
            }
            stages.push(Stage::WriteOutput);
            stages
        }
        InputMode::PrecomputedClips => vec![Stage::SortClips, Stage::CreateFirings, Stage::WriteOutput],
    }
}

/// What a run will do, computed without invoking any processor.
#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub mode: InputMode,
    pub dataset: Option<DatasetInfo>,
    pub segments: Vec<Segment>,
    pub threads: ThreadPlan,
    pub stages: Vec<Stage>,
}

impl RunPlan {
    /// Validate `config` and derive the plan. Reads raw source headers.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let mode = InputMode::from_config(config);
        let threads = ThreadPlan::derive(
            config.processing.intra_segment_parallelism,
            config.processing.inter_segment_threads,
            host_cores(),
        );

        let (dataset, segments) = match mode {
            InputMode::Raw => {
                let info = DatasetInfo::from_sources(&config.input.raw_sources())?;
                if config.signal.central_channel >= info.channel_count {
                    return Err(PipelineError::config(format!(
                        "central_channel {} out of range for {} channels",
                        config.signal.central_channel, info.channel_count
                    )));
                }
                let segments = plan_segments(info.sample_count, config.segment_samples())?;
                (Some(info), segments)
            }
            InputMode::PrecomputedClips => (None, Vec::new()),
        };

        let has_metrics = mode == InputMode::Raw && config.output.cluster_metrics.is_some();
        Ok(Self {
            mode,
            dataset,
            segments,
            threads,
            stages: stage_plan(mode, has_metrics),
        })
    }
}

impl std::fmt::Display for RunPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.dataset {
            Some(info) => writeln!(f, "Dataset: {}", info)?,
            None => writeln!(f, "Dataset: precomputed clips")?,
        }
        writeln!(f, "Threads: {}", self.threads)?;
        writeln!(f, "Segments: {}", self.segments.len())?;
        for segment in &self.segments {
            writeln!(f, "  {}", segment)?;
        }
        writeln!(f, "Stages:")?;
        for (i, stage) in self.stages.iter().enumerate() {
            writeln!(f, "  {:>2}. {}", i + 1, stage)?;
        }
        Ok(())
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: InputMode,
    pub dataset: Option<DatasetInfo>,
    pub segments: usize,
    pub threads: ThreadPlan,
    pub firings: usize,
    pub output: PathBuf,
    pub cluster_metrics: Option<PathBuf>,
    pub stage_secs: Vec<(Stage, f64)>,
    pub metrics: MetricsSnapshot,
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} firings from {} segments written to {} in {:.1}s",
            self.firings,
            self.segments,
            self.output.display(),
            self.metrics.elapsed.as_secs_f64()
        )
    }
}

/// Logs stage boundaries and records their durations.
struct StageClock {
    stages: Vec<Stage>,
    timings: Vec<(Stage, Duration)>,
    current: Option<(Stage, Instant)>,
}

impl StageClock {
    fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            timings: Vec::new(),
            current: None,
        }
    }

    fn begin(&mut self, stage: Stage) {
        self.end();
        let position = self.stages.iter().position(|s| *s == stage).map_or(0, |p| p + 1);
        tracing::info!("Stage {}/{}: {}", position, self.stages.len(), stage);
        self.current = Some((stage, Instant::now()));
    }

    fn end(&mut self) {
        if let Some((stage, start)) = self.current.take() {
            let elapsed = start.elapsed();
            tracing::info!("{} done in {:.1}s", stage, elapsed.as_secs_f64());
            self.timings.push((stage, elapsed));
        }
    }

    fn into_secs(mut self) -> Vec<(Stage, f64)> {
        self.end();
        self.timings
            .into_iter()
            .map(|(stage, d)| (stage, d.as_secs_f64()))
            .collect()
    }
}

/// Runs the whole workflow for one configuration.
pub struct PipelineDriver {
    config: Arc<Config>,
    plan: RunPlan,
    params: SortingParams,
    invoker: Invoker,
    store: Arc<ArtifactStore>,
    metrics: Arc<Metrics>,
}

impl PipelineDriver {
    /// Validate the configuration, plan the run and open the temp store.
    pub fn new(config: Config, backend: Arc<dyn ProcessorBackend>) -> Result<Self> {
        let plan = RunPlan::from_config(&config)?;
        let metrics = Metrics::new();
        metrics.set_total_segments(plan.segments.len() as u64);

        let store = Arc::new(ArtifactStore::open(
            &config.temp.dir,
            config.temp.prefix.as_str(),
            Some(metrics.clone()),
        )?);

        Ok(Self {
            params: SortingParams::from_config(&config),
            invoker: Invoker::new(backend, Some(metrics.clone())),
            config: Arc::new(config),
            plan,
            store,
            metrics,
        })
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run every stage, then release all temporaries whatever the outcome.
    pub async fn run(&self) -> Result<RunReport> {
        let result = self.execute().await;

        let summary = self.store.release_all();
        if summary.failed > 0 {
            tracing::warn!("Temporaries: {}", summary);
        } else {
            tracing::debug!("Temporaries: {}", summary);
        }

        if let Err(ref e) = result {
            tracing::error!("Run failed: {}", e);
        }
        result
    }

    async fn execute(&self) -> Result<RunReport> {
        let mut clock = StageClock::new(self.plan.stages.clone());
        let global = GlobalStages::new(
            self.invoker.clone(),
            self.params,
            self.plan.threads.global_threads,
        );

        let firings = match self.plan.mode {
            InputMode::Raw => self.run_segmented(&mut clock, &global).await?,
            InputMode::PrecomputedClips => self.run_precomputed(&mut clock, &global).await?,
        };

        clock.begin(Stage::WriteOutput);
        let output = self.config.output.firings.clone();
        copy_output(firings.path(), &output).await?;
        let count = record_count(firings.path()).await?;
        clock.end();

        Ok(RunReport {
            mode: self.plan.mode,
            dataset: self.plan.dataset,
            segments: self.plan.segments.len(),
            threads: self.plan.threads,
            firings: count,
            output,
            cluster_metrics: match self.plan.mode {
                InputMode::Raw => self.config.output.cluster_metrics.clone(),
                InputMode::PrecomputedClips => None,
            },
            stage_secs: clock.into_secs(),
            metrics: self.metrics.snapshot(),
        })
    }

    async fn run_segmented(&self, clock: &mut StageClock, global: &GlobalStages) -> Result<Artifact<Firings>> {
        let raw: Vec<Artifact<Timeseries>> = self
            .config
            .input
            .raw_sources()
            .into_iter()
            .map(Artifact::external)
            .collect();
        let segments = &self.plan.segments;

        clock.begin(Stage::PlanSegments);
        if let Some(info) = &self.plan.dataset {
            tracing::info!("Dataset: {}", info);
        }
        tracing::info!("{} segments, {}", segments.len(), self.plan.threads);
        let detections = segments
            .iter()
            .map(|segment| DetectionArtifacts::allocate(&self.store, segment))
            .collect::<Result<Vec<_>>>()?;

        clock.begin(Stage::DetectSegments);
        let chains = segments
            .iter()
            .zip(&detections)
            .map(|(segment, arts)| {
                detection_chain(*segment, &raw, arts, &self.params, self.plan.threads.processor_threads)
            })
            .collect();
        self.segment_runner().run(chains).await?;

        clock.begin(Stage::MergeEventTimes);
        let seg_times: Vec<Artifact<EventTimes>> = detections.iter().map(|d| d.event_times.clone()).collect();
        let event_times = self.merge::<EventTimes>("event_times.mda", &seg_times).await?;

        clock.begin(Stage::MergeAmplitudes);
        let seg_amps: Vec<Artifact<Amplitudes>> = detections.iter().map(|d| d.amplitudes.clone()).collect();
        let amplitudes = self.merge::<Amplitudes>("amplitudes.mda", &seg_amps).await?;
        self.release_all_of(&seg_times)?;
        self.release_all_of(&seg_amps)?;

        let filtered: Vec<Artifact<Timeseries>> = detections.iter().map(|d| d.filtered.clone()).collect();

        clock.begin(Stage::ExtractClips);
        let clips: Artifact<Clips> = self.store.allocate("clips.mda")?;
        global.extract_clips(&filtered, &event_times, &clips).await?;

        clock.begin(Stage::WhiteningMatrix);
        let whitening: Artifact<WhiteningMatrix> = self.store.allocate("whitening_matrix.mda")?;
        global.compute_whitening_matrix(&filtered, &whitening).await?;

        clock.begin(Stage::WhitenClips);
        let clips_white: Artifact<Clips> = self.store.allocate("clips_white.mda")?;
        global.whiten_clips(&clips, &whitening, &clips_white).await?;
        self.release_all_of(std::slice::from_ref(&clips))?;

        clock.begin(Stage::SortClips);
        let labels: Artifact<Labels> = self.store.allocate("labels.mda")?;
        global.sort_clips(&clips_white, &labels).await?;

        clock.begin(Stage::CreateFirings);
        let firings: Artifact<Firings> = self.store.allocate("firings.mda")?;
        global
            .create_firings(&event_times, &labels, Some(&amplitudes), &firings)
            .await?;

        clock.begin(Stage::FitSegments);
        let fits = segments
            .iter()
            .map(|segment| FitArtifacts::allocate(&self.store, segment))
            .collect::<Result<Vec<_>>>()?;
        let chains = segments
            .iter()
            .zip(&detections)
            .zip(&fits)
            .map(|((segment, det), fit)| fit_chain(*segment, &firings, &det.filtered, fit))
            .collect();
        self.segment_runner().run(chains).await?;

        clock.begin(Stage::MergeFirings);
        let seg_firings: Vec<Artifact<Firings>> = fits.iter().map(|f| f.firings.clone()).collect();
        let final_firings = self.merge::<Firings>("firings_final.mda", &seg_firings).await?;
        self.release_all_of(&seg_firings)?;

        if let Some(destination) = &self.config.output.cluster_metrics {
            clock.begin(Stage::ClusterMetrics);
            let metrics_out = Artifact::<ClusterMetrics>::external(destination);
            global.cluster_metrics(&raw, &final_firings, &metrics_out).await?;
        }

        Ok(final_firings)
    }

    async fn run_precomputed(&self, clock: &mut StageClock, global: &GlobalStages) -> Result<Artifact<Firings>> {
        let input = &self.config.input;
        let (Some(clips), Some(times)) = (&input.clips, &input.event_times) else {
            return Err(PipelineError::config(
                "precomputed mode needs input.clips and input.event_times",
            ));
        };
        let clips = Artifact::<Clips>::external(clips);
        let event_times = Artifact::<EventTimes>::external(times);
        let amplitudes = input.amplitudes.as_ref().map(Artifact::<Amplitudes>::external);

        if self.config.output.cluster_metrics.is_some() {
            tracing::warn!("Cluster metrics need raw sources; skipping them for precomputed clips");
        }

        clock.begin(Stage::SortClips);
        let labels: Artifact<Labels> = self.store.allocate("labels.mda")?;
        global.sort_clips(&clips, &labels).await?;

        clock.begin(Stage::CreateFirings);
        let firings: Artifact<Firings> = self.store.allocate("firings_final.mda")?;
        global
            .create_firings(&event_times, &labels, amplitudes.as_ref(), &firings)
            .await?;

        Ok(firings)
    }

    fn segment_runner(&self) -> SegmentStageRunner {
        let executor = Arc::new(ChainExecutor::new(
            self.invoker.clone(),
            self.store.clone(),
            Some(self.metrics.clone()),
        ));
        SegmentStageRunner::new(
            executor,
            self.metrics.clone(),
            RunnerConfig {
                segment_parallelism: self.plan.threads.segment_parallelism,
                enable_metrics: self.config.processing.enable_metrics,
                metrics_interval_secs: self.config.processing.metrics_interval_secs,
            },
        )
    }

    /// Concatenate per-segment artifacts, in segment order, into a new temporary.
    async fn merge<K: ArtifactKind>(&self, name: &str, parts: &[Artifact<K>]) -> Result<Artifact<K>> {
        let output: Artifact<K> = self.store.allocate(name)?;
        let inputs = paths(parts);
        let out_path = output.path().to_path_buf();

        let start = Instant::now();
        let records = tokio::task::spawn_blocking(move || concat_files(&inputs, &out_path))
            .await
            .map_err(|e| PipelineError::invocation("concatenate", "global", e))?
            .map_err(|e| PipelineError::invocation("concatenate", "global", e))?;

        self.metrics.add_builtin_time(start.elapsed());
        self.metrics.add_records_merged(records as u64);
        tracing::info!("Merged {} records from {} segments into {}", records, parts.len(), name);
        Ok(output)
    }

    /// Release temporaries whose last consumer was a global stage.
    fn release_all_of<K: ArtifactKind>(&self, artifacts: &[Artifact<K>]) -> Result<()> {
        for artifact in artifacts {
            self.store
                .release(artifact.handle())
                .map_err(|e| PipelineError::invocation("release", "global", e))?;
        }
        Ok(())
    }
}

async fn copy_output(from: &Path, to: &Path) -> Result<()> {
    let failed = |e: PipelineError| PipelineError::invocation("write_output", "global", e);
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| failed(PipelineError::resource(parent, e)))?;
    }
    tokio::fs::copy(from, to)
        .await
        .map_err(|e| failed(PipelineError::resource(to, e)))?;
    Ok(())
}

async fn record_count(path: &Path) -> Result<usize> {
    let path = path.to_path_buf();
    let header = tokio::task::spawn_blocking(move || crate::io::mda::MdaHeader::read_from(&path))
        .await
        .map_err(|e| PipelineError::invocation("write_output", "global", e))??;
    Ok(header.dim1())
}
