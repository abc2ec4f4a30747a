//! Deterministic in-process stand-in for the external processors.
//!
//! Each processor does the simplest thing that keeps the data flow honest:
//! detection thresholds the central channel, clustering splits clips by peak
//! size, fitting checks that it was handed segment-local times.

use super::{ParamValue, ProcessorBackend, StageStep};
use crate::io::mda::{ElementType, MdaTable};
use crate::pipeline::concat_tables;
use anyhow::{anyhow, bail, Context};
use futures::future::BoxFuture;
use ndarray::{s, Array2};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Records every step and optionally fails the n-th call of one processor.
#[derive(Default)]
pub(crate) struct FakeBackend {
    calls: Mutex<Vec<StageStep>>,
    fail_on: Option<(&'static str, usize)>,
    delay: Option<Duration>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail the `nth` (0-based) invocation of `processor`.
    pub(crate) fn fail_on(mut self, processor: &'static str, nth: usize) -> Self {
        self.fail_on = Some((processor, nth));
        self
    }

    /// Sleep before every successful call, after it has been recorded.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> Vec<StageStep> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn calls_to(&self, processor: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.processor == processor)
            .count()
    }

    fn record(&self, step: &StageStep) -> anyhow::Result<()> {
        let nth = {
            let mut calls = self.calls.lock().unwrap();
            let nth = calls.iter().filter(|s| s.processor == step.processor).count();
            calls.push(step.clone());
            nth
        };
        if self.fail_on == Some((step.processor, nth)) {
            bail!("injected failure");
        }
        Ok(())
    }

    fn execute(&self, step: &StageStep) -> anyhow::Result<()> {
        match step.processor {
            "extract_segment_timeseries" => {
                let joined = concat_tables(&inputs(step, "timeseries")?)?;
                let (t1, t2) = (param(step, "t1")? as usize, param(step, "t2")? as usize);
                if t2 >= joined.records() {
                    bail!("t2={} beyond {} samples", t2, joined.records());
                }
                let data = joined.data.slice(s![.., t1..=t2]).to_owned();
                write(step, "timeseries_out", MdaTable::new(joined.element_type, data))
            }
            "bandpass_filter" => write(step, "timeseries_out", input(step, "timeseries")?),
            "detect_events" => {
                let ts = input(step, "timeseries")?;
                let channel = param(step, "central_channel")? as usize;
                let threshold = param_f64(step, "detect_threshold")?;
                let times: Vec<f64> = ts
                    .data
                    .row(channel)
                    .iter()
                    .enumerate()
                    .filter(|&(_, &v)| v.abs() >= threshold)
                    .map(|(t, _)| t as f64)
                    .collect();
                write(step, "event_times_out", MdaTable::from_row(ElementType::F64, times))
            }
            "compute_amplitudes" => {
                let ts = input(step, "timeseries")?;
                let times = input(step, "event_times")?;
                let channel = param(step, "central_channel")? as usize;
                let amps = times
                    .data
                    .row(0)
                    .iter()
                    .map(|&t| {
                        ts.data
                            .get([channel, t as usize])
                            .copied()
                            .ok_or_else(|| anyhow!("event time {} outside timeseries", t))
                    })
                    .collect::<anyhow::Result<Vec<f64>>>()?;
                write(step, "amplitudes_out", MdaTable::from_row(ElementType::F64, amps))
            }
            "extract_clips" => {
                let joined = concat_tables(&inputs(step, "timeseries")?)?;
                let times = input(step, "event_times")?;
                let clip_size = param(step, "clip_size")? as usize;
                let (channels, samples) = (joined.rows(), joined.records());
                let mut clips = Array2::zeros((channels * clip_size, times.records()));
                for (j, &t) in times.data.row(0).iter().enumerate() {
                    for c in 0..clip_size {
                        let sample = (t as usize + c).min(samples - 1);
                        for m in 0..channels {
                            clips[[c * channels + m, j]] = joined.data[[m, sample]];
                        }
                    }
                }
                write(step, "clips_out", MdaTable::new(ElementType::F64, clips))
            }
            "compute_whitening_matrix" => {
                let first = inputs(step, "timeseries_list")?
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow!("no timeseries"))?;
                let m = first.rows();
                write(step, "whitening_matrix_out", MdaTable::new(ElementType::F64, Array2::eye(m)))
            }
            "whiten_clips" => {
                let matrix = input(step, "whitening_matrix")?;
                if matrix.rows() != matrix.records() {
                    bail!("whitening matrix is not square");
                }
                write(step, "clips_out", input(step, "clips")?)
            }
            "sort_clips" => {
                let clips = input(step, "clips")?;
                let labels: Vec<f64> = clips
                    .data
                    .columns()
                    .into_iter()
                    .map(|col| {
                        let peak = col.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
                        if peak >= 15.0 { 2.0 } else { 1.0 }
                    })
                    .collect();
                write(step, "labels_out", MdaTable::from_row(ElementType::F64, labels))
            }
            "create_firings" => {
                let times = input(step, "event_times")?;
                let labels = input(step, "labels")?;
                let channel = param(step, "central_channel")? as f64;
                let n = times.records();
                if labels.records() != n {
                    bail!("{} labels for {} events", labels.records(), n);
                }
                let amps = match step.input_path("amplitudes") {
                    Some(path) => read(path)?.data.row(0).to_vec(),
                    None => vec![0.0; n],
                };
                if amps.len() != n {
                    bail!("{} amplitudes for {} events", amps.len(), n);
                }
                let mut firings = Array2::zeros((4, n));
                for j in 0..n {
                    firings[[0, j]] = channel;
                    firings[[1, j]] = times.data[[0, j]];
                    firings[[2, j]] = labels.data[[0, j]];
                    firings[[3, j]] = amps[j];
                }
                write(step, "firings_out", MdaTable::new(ElementType::F64, firings))
            }
            "fit_stage" => {
                let ts = input(step, "timeseries")?;
                let firings = input(step, "firings")?;
                let len = ts.records() as f64;
                if let Some(&t) = firings.data.row(1).iter().find(|&&t| t < 0.0 || t >= len) {
                    bail!("firing time {} outside local range [0, {})", t, len);
                }
                write(step, "firings_out", firings)
            }
            "cluster_metrics" => {
                let firings = input(step, "firings")?;
                let mut counts: BTreeMap<i64, u64> = BTreeMap::new();
                for &label in firings.data.row(2) {
                    *counts.entry(label as i64).or_default() += 1;
                }
                let mut table = Array2::zeros((2, counts.len()));
                for (j, (label, count)) in counts.into_iter().enumerate() {
                    table[[0, j]] = label as f64;
                    table[[1, j]] = count as f64;
                }
                write(step, "cluster_metrics_out", MdaTable::new(ElementType::F64, table))
            }
            other => bail!("unknown processor {}", other),
        }
    }
}

impl ProcessorBackend for FakeBackend {
    fn invoke<'a>(&'a self, step: &'a StageStep) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            self.record(step)?;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.execute(step)
        })
    }
}

fn read(path: &Path) -> anyhow::Result<MdaTable> {
    MdaTable::read(path).with_context(|| format!("reading {}", path.display()))
}

fn inputs(step: &StageStep, name: &str) -> anyhow::Result<Vec<MdaTable>> {
    step.inputs
        .get(name)
        .ok_or_else(|| anyhow!("missing input {}", name))?
        .iter()
        .map(|p| read(p))
        .collect()
}

fn input(step: &StageStep, name: &str) -> anyhow::Result<MdaTable> {
    read(step.input_path(name).ok_or_else(|| anyhow!("missing input {}", name))?)
}

fn write(step: &StageStep, name: &str, table: MdaTable) -> anyhow::Result<()> {
    let path = step
        .outputs
        .get(name)
        .ok_or_else(|| anyhow!("missing output {}", name))?;
    table.write(path)?;
    Ok(())
}

fn param(step: &StageStep, name: &str) -> anyhow::Result<i64> {
    match step.params.get(name) {
        Some(ParamValue::Int(v)) => Ok(*v),
        Some(ParamValue::Float(v)) => Ok(*v as i64),
        None => Err(anyhow!("missing param {}", name)),
    }
}

fn param_f64(step: &StageStep, name: &str) -> anyhow::Result<f64> {
    match step.params.get(name) {
        Some(ParamValue::Int(v)) => Ok(*v as f64),
        Some(ParamValue::Float(v)) => Ok(*v),
        None => Err(anyhow!("missing param {}", name)),
    }
}
