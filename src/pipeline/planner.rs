//! Partitioning of the sample range into segments.

use crate::error::{PipelineError, Result};
use serde::Serialize;

/// A contiguous span of global sample indices `[t1, t2]` (both inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub index: usize,
    pub t1: u64,
    pub t2: u64,
}

impl Segment {
    /// Number of samples in the segment. Never zero since `t1 <= t2`.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.t2 - self.t1 + 1
    }

    /// Whether a global sample index falls inside this segment.
    pub fn contains(&self, t: i64) -> bool {
        t >= self.t1 as i64 && t <= self.t2 as i64
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "segment {} [{}, {}]", self.index, self.t1, self.t2)
    }
}

/// Segment length in samples for a duration and sample rate.
pub fn segment_length(duration_sec: f64, sample_rate: f64) -> u64 {
    let samples = (duration_sec * sample_rate).ceil();
    if samples.is_finite() && samples > 0.0 {
        samples as u64
    } else {
        0
    }
}

/// Split `[0, total_samples)` into consecutive segments of `segment_len`
/// samples. The last segment is clamped to end at `total_samples - 1`.
pub fn plan_segments(total_samples: u64, segment_len: u64) -> Result<Vec<Segment>> {
    if total_samples == 0 {
        return Err(PipelineError::planning("dataset has no samples"));
    }
    if segment_len == 0 {
        return Err(PipelineError::planning("segment length is zero samples"));
    }

    let mut segments = Vec::with_capacity(total_samples.div_ceil(segment_len) as usize);
    let mut t1 = 0u64;
    loop {
        let end = t1 + segment_len - 1;
        if end >= total_samples - 1 {
            segments.push(Segment {
                index: segments.len(),
                t1,
                t2: total_samples - 1,
            });
            break;
        }
        segments.push(Segment {
            index: segments.len(),
            t1,
            t2: end,
        });
        t1 += segment_len;
    }

    Ok(segments)
}
