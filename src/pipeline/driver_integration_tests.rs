//! End-to-end runs of the driver against the in-process fake processors.

use super::{host_cores, PipelineDriver, RunReport};
use crate::config::tests::make_test_config;
use crate::config::{Config, SourceList};
use crate::error::PipelineError;
use crate::io::mda::{ElementType, MdaTable};
use crate::processor::fake::FakeBackend;
use crate::processor::{ParamValue, REQUEST_THREADS_PARAM};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

const CHANNELS: usize = 4;
const SAMPLES: usize = 10_000;

/// (global time, value on channel 0)
const SPIKES: [(usize, f64); 6] = [
    (15, 10.0),
    (1999, 20.0),
    (2000, -12.0),
    (4321, 25.0),
    (7000, 5.0),
    (9999, -18.0),
];

struct Scenario {
    dir: TempDir,
    config: Config,
}

impl Scenario {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw.mda");
        write_raw(&raw, SAMPLES);

        let mut config = make_test_config();
        config.input.raw = SourceList::One(raw);
        config.output.firings = dir.path().join("out").join("firings.mda");
        config.temp.dir = dir.path().join("tmp");
        config.processing.enable_metrics = false;

        Self { dir, config }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    async fn run(&self, backend: &Arc<FakeBackend>) -> Result<RunReport, PipelineError> {
        PipelineDriver::new(self.config.clone(), backend.clone())?.run().await
    }

    fn firings(&self) -> MdaTable {
        MdaTable::read(&self.config.output.firings).unwrap()
    }

    fn temp_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.config.temp.dir)
            .map(|entries| entries.map(|e| e.unwrap().path()).collect())
            .unwrap_or_default()
    }
}

/// Raw recording with spikes on channel 0, zeros elsewhere. `offset`
/// shifts which global spikes fall into this file.
fn write_raw_part(path: &Path, offset: usize, samples: usize) {
    let mut data = Array2::zeros((CHANNELS, samples));
    for &(t, v) in &SPIKES {
        if t >= offset && t < offset + samples {
            data[[0, t - offset]] = v;
        }
    }
    MdaTable::new(ElementType::F32, data).write(path).unwrap();
}

fn write_raw(path: &Path, samples: usize) {
    write_raw_part(path, 0, samples);
}

fn spike_times() -> Vec<f64> {
    SPIKES.iter().map(|&(t, _)| t as f64).collect()
}

#[tokio::test]
async fn test_five_segment_run() {
    let scenario = Scenario::new();
    let backend = Arc::new(FakeBackend::new());
    let report = scenario.run(&backend).await.unwrap();

    assert_eq!(report.segments, 5);
    assert_eq!(report.firings, SPIKES.len());
    assert_eq!(report.dataset.unwrap().channel_count, CHANNELS);

    let firings = scenario.firings();
    assert_eq!(firings.rows(), 4);
    assert_eq!(firings.data.row(0).to_vec(), vec![0.0; SPIKES.len()]);
    assert_eq!(firings.data.row(1).to_vec(), spike_times());
    assert_eq!(firings.data.row(2).to_vec(), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    assert_eq!(
        firings.data.row(3).to_vec(),
        SPIKES.iter().map(|&(_, v)| v).collect::<Vec<_>>()
    );

    // Segment boundaries handed to the extractor
    let bounds: Vec<(ParamValue, ParamValue)> = backend
        .calls()
        .iter()
        .filter(|s| s.processor == "extract_segment_timeseries")
        .map(|s| (s.params["t1"].clone(), s.params["t2"].clone()))
        .collect();
    let expected: Vec<(ParamValue, ParamValue)> = [(0, 1999), (2000, 3999), (4000, 5999), (6000, 7999), (8000, 9999)]
        .iter()
        .map(|&(a, b)| (ParamValue::Int(a), ParamValue::Int(b)))
        .collect();
    assert_eq!(bounds, expected);

    for per_segment in ["bandpass_filter", "detect_events", "compute_amplitudes", "fit_stage"] {
        assert_eq!(backend.calls_to(per_segment), 5, "{}", per_segment);
    }
    for global in ["extract_clips", "compute_whitening_matrix", "whiten_clips", "sort_clips", "create_firings"] {
        assert_eq!(backend.calls_to(global), 1, "{}", global);
    }
}

#[tokio::test]
async fn test_global_stages_see_every_segment() {
    let scenario = Scenario::new();
    let backend = Arc::new(FakeBackend::new());
    scenario.run(&backend).await.unwrap();

    let calls = backend.calls();
    let whitening = calls
        .iter()
        .find(|s| s.processor == "compute_whitening_matrix")
        .unwrap();
    assert_eq!(whitening.inputs["timeseries_list"].len(), 5);
    assert_eq!(
        whitening.params[REQUEST_THREADS_PARAM],
        ParamValue::Int(host_cores() as i64)
    );

    // Every per-segment call precedes the first global call
    let first_global = calls.iter().position(|s| s.processor == "extract_clips").unwrap();
    let last_detect = calls.iter().rposition(|s| s.processor == "compute_amplitudes").unwrap();
    let first_fit = calls.iter().position(|s| s.processor == "fit_stage").unwrap();
    let create = calls.iter().position(|s| s.processor == "create_firings").unwrap();
    assert!(last_detect < first_global);
    assert!(create < first_fit);
}

#[tokio::test]
async fn test_no_cluster_metrics_without_destination() {
    let scenario = Scenario::new();
    let backend = Arc::new(FakeBackend::new());
    let report = scenario.run(&backend).await.unwrap();

    assert_eq!(backend.calls_to("cluster_metrics"), 0);
    assert!(report.cluster_metrics.is_none());
    assert!(scenario.config.output.firings.exists());
}

#[tokio::test]
async fn test_cluster_metrics_with_destination() {
    let mut scenario = Scenario::new();
    let destination = scenario.path("cluster_metrics.mda");
    scenario.config.output.cluster_metrics = Some(destination.clone());

    let backend = Arc::new(FakeBackend::new());
    scenario.run(&backend).await.unwrap();

    assert_eq!(backend.calls_to("cluster_metrics"), 1);
    let metrics = MdaTable::read(&destination).unwrap();
    // labels 1 and 2, three events each
    assert_eq!(metrics.data.row(0).to_vec(), vec![1.0, 2.0]);
    assert_eq!(metrics.data.row(1).to_vec(), vec![3.0, 3.0]);
}

#[tokio::test]
async fn test_failure_on_segment_two_stops_run() {
    let scenario = Scenario::new();
    // Calls are 0-based: the third detection belongs to segment 2
    let backend = Arc::new(FakeBackend::new().fail_on("detect_events", 2));
    let err = scenario.run(&backend).await.unwrap_err();

    assert_eq!(err.processor(), Some("detect_events"));
    assert!(err.to_string().contains("segment 2"));

    assert_eq!(backend.calls_to("extract_segment_timeseries"), 3);
    for never in ["extract_clips", "compute_whitening_matrix", "sort_clips", "create_firings", "fit_stage"] {
        assert_eq!(backend.calls_to(never), 0, "{}", never);
    }
    assert!(!scenario.config.output.firings.exists());
    assert!(scenario.temp_files().is_empty());
}

#[tokio::test]
async fn test_failure_in_fit_phase_cleans_up() {
    let scenario = Scenario::new();
    let backend = Arc::new(FakeBackend::new().fail_on("fit_stage", 1));
    let err = scenario.run(&backend).await.unwrap_err();

    assert_eq!(err.processor(), Some("fit_stage"));
    assert!(err.to_string().contains("segment 1"));
    assert!(!scenario.config.output.firings.exists());
    assert!(scenario.temp_files().is_empty());
}

#[tokio::test]
async fn test_runs_are_deterministic() {
    let first = Scenario::new();
    let second = Scenario::new();
    first.run(&Arc::new(FakeBackend::new())).await.unwrap();
    second.run(&Arc::new(FakeBackend::new())).await.unwrap();

    let a = std::fs::read(&first.config.output.firings).unwrap();
    let b = std::fs::read(&second.config.output.firings).unwrap();
    assert_eq!(a, b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_segments_match_sequential() {
    let sequential = Scenario::new();
    sequential.run(&Arc::new(FakeBackend::new())).await.unwrap();

    let mut parallel = Scenario::new();
    parallel.config.processing.intra_segment_parallelism = 3;
    let backend = Arc::new(FakeBackend::new());
    let report = parallel.run(&backend).await.unwrap();

    assert_eq!(report.threads.segment_parallelism, 3);
    assert_eq!(report.threads.processor_threads, 1);
    let detect = backend
        .calls()
        .into_iter()
        .find(|s| s.processor == "detect_events")
        .unwrap();
    assert_eq!(detect.params[REQUEST_THREADS_PARAM], ParamValue::Int(1));

    assert_eq!(
        std::fs::read(&sequential.config.output.firings).unwrap(),
        std::fs::read(&parallel.config.output.firings).unwrap()
    );
}

#[tokio::test]
async fn test_thread_override_reaches_processors() {
    let mut scenario = Scenario::new();
    scenario.config.processing.inter_segment_threads = Some(3);
    let backend = Arc::new(FakeBackend::new());
    scenario.run(&backend).await.unwrap();

    for step in backend.calls() {
        if let Some(threads) = step.params.get(REQUEST_THREADS_PARAM) {
            assert_eq!(threads, &ParamValue::Int(3), "{}", step.processor);
        }
    }
}

#[tokio::test]
async fn test_fit_sees_local_times_and_output_is_global() {
    let scenario = Scenario::new();
    let backend = Arc::new(FakeBackend::new());
    scenario.run(&backend).await.unwrap();

    // The fake fit step rejects out-of-range times, so reaching here means
    // each segment received local coordinates; the output must be global.
    assert_eq!(scenario.firings().data.row(1).to_vec(), spike_times());
}

#[tokio::test]
async fn test_no_temporaries_left_after_success() {
    let scenario = Scenario::new();
    let report = scenario.run(&Arc::new(FakeBackend::new())).await.unwrap();

    assert!(scenario.temp_files().is_empty());
    assert_eq!(report.metrics.records_merged, (SPIKES.len() * 3) as u64);
    assert!(report.metrics.artifacts_allocated > 0);
    assert_eq!(report.metrics.segments_detected, 5);
    assert_eq!(report.metrics.segments_fit, 5);
}

#[tokio::test]
async fn test_concatenated_raw_sources() {
    let mut scenario = Scenario::new();
    let part1 = scenario.path("raw_1.mda");
    let part2 = scenario.path("raw_2.mda");
    write_raw_part(&part1, 0, 6000);
    write_raw_part(&part2, 6000, 4000);
    scenario.config.input.raw = SourceList::Many(vec![part1, part2]);

    let backend = Arc::new(FakeBackend::new());
    let report = scenario.run(&backend).await.unwrap();

    assert_eq!(report.dataset.unwrap().sample_count, SAMPLES as u64);
    assert_eq!(report.segments, 5);
    assert_eq!(scenario.firings().data.row(1).to_vec(), spike_times());
}

#[tokio::test]
async fn test_short_final_segment() {
    let mut scenario = Scenario::new();
    write_raw(&scenario.path("raw.mda"), 9_500);
    scenario.config.input.raw = SourceList::One(scenario.path("raw.mda"));

    let backend = Arc::new(FakeBackend::new());
    let report = scenario.run(&backend).await.unwrap();
    assert_eq!(report.segments, 5);

    let last = backend
        .calls()
        .into_iter()
        .filter(|s| s.processor == "extract_segment_timeseries")
        .last()
        .unwrap();
    assert_eq!(last.params["t1"], ParamValue::Int(8000));
    assert_eq!(last.params["t2"], ParamValue::Int(9499));
    // The spike at 9999 is past the end
    assert_eq!(report.firings, SPIKES.len() - 1);
}

#[tokio::test]
async fn test_precomputed_clips() {
    let mut scenario = Scenario::new();
    let clips = scenario.path("clips.mda");
    let times = scenario.path("times.mda");
    MdaTable::new(ElementType::F64, ndarray::array![[3.0, 30.0, -4.0], [0.0, 0.0, 16.0]])
        .write(&clips)
        .unwrap();
    MdaTable::from_row(ElementType::F64, vec![100.0, 250.0, 900.0])
        .write(&times)
        .unwrap();

    scenario.config.input = crate::config::InputConfig {
        clips: Some(clips),
        event_times: Some(times),
        ..Default::default()
    };
    scenario.config.output.cluster_metrics = Some(scenario.path("metrics.mda"));

    let backend = Arc::new(FakeBackend::new());
    let report = scenario.run(&backend).await.unwrap();

    assert_eq!(report.segments, 0);
    assert_eq!(backend.calls_to("sort_clips"), 1);
    assert_eq!(backend.calls_to("create_firings"), 1);
    assert_eq!(backend.calls_to("extract_segment_timeseries"), 0);
    assert_eq!(backend.calls_to("cluster_metrics"), 0);

    let firings = scenario.firings();
    assert_eq!(firings.data.row(1).to_vec(), vec![100.0, 250.0, 900.0]);
    assert_eq!(firings.data.row(2).to_vec(), vec![1.0, 2.0, 2.0]);
    assert!(scenario.temp_files().is_empty());
}

#[tokio::test]
async fn test_invalid_config_fails_before_any_invocation() {
    let mut scenario = Scenario::new();
    scenario.config.signal.sample_rate = 0.0;
    let backend = Arc::new(FakeBackend::new());

    let err = scenario.run(&backend).await.unwrap_err();
    assert!(matches!(err, PipelineError::Config { .. }));
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn test_central_channel_out_of_range() {
    let mut scenario = Scenario::new();
    scenario.config.signal.central_channel = CHANNELS;
    let err = scenario.run(&Arc::new(FakeBackend::new())).await.unwrap_err();
    assert!(matches!(err, PipelineError::Config { .. }));
}
