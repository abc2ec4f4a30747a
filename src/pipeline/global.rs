//! Dataset-wide stages, each a single processor invocation.

use crate::artifacts::{
    Amplitudes, Artifact, Clips, ClusterMetrics, EventTimes, Firings, Labels, Timeseries,
    WhiteningMatrix,
};
use crate::error::Result;
use crate::processor::{InvocationContext, Invoker, ProcessorRequest, SortingParams};

/// Issues the global stages with the run's parameters and thread budget.
pub struct GlobalStages {
    invoker: Invoker,
    params: SortingParams,
    threads: usize,
}

impl GlobalStages {
    pub fn new(invoker: Invoker, params: SortingParams, threads: usize) -> Self {
        Self {
            invoker,
            params,
            threads,
        }
    }

    async fn invoke(&self, request: ProcessorRequest) -> Result<()> {
        self.invoker.invoke(&request, InvocationContext::Global).await
    }

    /// Clips around every merged event, read from the filtered slices in order.
    pub async fn extract_clips(
        &self,
        filtered: &[Artifact<Timeseries>],
        event_times: &Artifact<EventTimes>,
        output: &Artifact<Clips>,
    ) -> Result<()> {
        self.invoke(ProcessorRequest::ExtractClips {
            timeseries: filtered.to_vec(),
            event_times: event_times.clone(),
            output: output.clone(),
            clip_size: self.params.clip_size,
        })
        .await
    }

    pub async fn compute_whitening_matrix(
        &self,
        filtered: &[Artifact<Timeseries>],
        output: &Artifact<WhiteningMatrix>,
    ) -> Result<()> {
        self.invoke(ProcessorRequest::ComputeWhiteningMatrix {
            timeseries: filtered.to_vec(),
            output: output.clone(),
            threads: self.threads,
        })
        .await
    }

    pub async fn whiten_clips(
        &self,
        clips: &Artifact<Clips>,
        whitening_matrix: &Artifact<WhiteningMatrix>,
        output: &Artifact<Clips>,
    ) -> Result<()> {
        self.invoke(ProcessorRequest::WhitenClips {
            clips: clips.clone(),
            whitening_matrix: whitening_matrix.clone(),
            output: output.clone(),
            threads: self.threads,
        })
        .await
    }

    /// One label per clip.
    pub async fn sort_clips(&self, clips: &Artifact<Clips>, output: &Artifact<Labels>) -> Result<()> {
        self.invoke(ProcessorRequest::SortClips {
            clips: clips.clone(),
            output: output.clone(),
            threads: self.threads,
        })
        .await
    }

    /// Firing table from global event times, labels and optional amplitudes.
    pub async fn create_firings(
        &self,
        event_times: &Artifact<EventTimes>,
        labels: &Artifact<Labels>,
        amplitudes: Option<&Artifact<Amplitudes>>,
        output: &Artifact<Firings>,
    ) -> Result<()> {
        self.invoke(ProcessorRequest::CreateFirings {
            event_times: event_times.clone(),
            labels: labels.clone(),
            amplitudes: amplitudes.cloned(),
            output: output.clone(),
            central_channel: self.params.central_channel,
        })
        .await
    }

    /// Per-cluster metrics over the raw sources and the final firings.
    pub async fn cluster_metrics(
        &self,
        raw: &[Artifact<Timeseries>],
        firings: &Artifact<Firings>,
        output: &Artifact<ClusterMetrics>,
    ) -> Result<()> {
        self.invoke(ProcessorRequest::ClusterMetrics {
            timeseries: raw.to_vec(),
            firings: firings.clone(),
            output: output.clone(),
            sample_rate: self.params.sample_rate,
        })
        .await
    }
}
