//! Dataset dimensions derived from raw source headers.

use crate::error::{PipelineError, Result};
use crate::io::mda::MdaHeader;
use serde::Serialize;
use std::path::PathBuf;

/// Size of the (possibly virtually concatenated) raw time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatasetInfo {
    /// Number of channels (first dimension of every source)
    pub channel_count: usize,

    /// Total number of samples across all sources
    pub sample_count: u64,
}

impl DatasetInfo {
    /// Read headers of one or more raw sources.
    ///
    /// Multiple sources are treated as a concatenation along the time axis:
    /// sample counts add up and channel counts must agree.
    pub fn from_sources(sources: &[PathBuf]) -> Result<Self> {
        let headers = sources
            .iter()
            .map(|path| {
                MdaHeader::read_from(path).map_err(|e| {
                    PipelineError::config(format!(
                        "cannot read raw source header {}: {}",
                        path.display(),
                        e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let dims: Vec<(usize, u64)> = headers
            .iter()
            .map(|h| (h.dim0(), h.dim1() as u64))
            .collect();
        Self::from_dims(&dims)
    }

    /// Combine per-source `(channels, samples)` pairs.
    pub fn from_dims(dims: &[(usize, u64)]) -> Result<Self> {
        let (channel_count, _) = *dims
            .first()
            .ok_or_else(|| PipelineError::config("no raw sources given"))?;

        let mut sample_count = 0u64;
        for (i, &(channels, samples)) in dims.iter().enumerate() {
            if channels != channel_count {
                return Err(PipelineError::config(format!(
                    "raw source {} has {} channels, expected {}",
                    i, channels, channel_count
                )));
            }
            sample_count += samples;
        }

        Ok(Self {
            channel_count,
            sample_count,
        })
    }
}

impl std::fmt::Display for DatasetInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} channels x {} samples", self.channel_count, self.sample_count)
    }
}
