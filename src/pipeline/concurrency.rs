//! Two-level concurrency policy.
//!
//! Segment chains run `K` at a time. Each processor invocation is asked for
//! an internal thread count; when several chains share the host, each
//! processor gets a single thread so the total stays near the core count.

use serde::Serialize;

/// Thread counts for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadPlan {
    /// Segment chains running concurrently
    pub segment_parallelism: usize,

    /// Threads requested by each per-segment processor invocation
    pub processor_threads: usize,

    /// Threads requested by each global-stage invocation
    pub global_threads: usize,
}

impl ThreadPlan {
    /// Derive the plan.
    ///
    /// `thread_override` wins whenever it is set and nonzero. Otherwise
    /// per-segment processors get `host_cores` when chains run one at a time
    /// and 1 when they run concurrently. Global stages run alone and get
    /// `host_cores` unless overridden.
    pub fn derive(segment_parallelism: usize, thread_override: Option<usize>, host_cores: usize) -> Self {
        let segment_parallelism = segment_parallelism.max(1);
        let host_cores = host_cores.max(1);
        let thread_override = thread_override.filter(|&n| n > 0);

        let processor_threads = match thread_override {
            Some(n) => n,
            None if segment_parallelism <= 1 => host_cores,
            None => 1,
        };

        Self {
            segment_parallelism,
            processor_threads,
            global_threads: thread_override.unwrap_or(host_cores),
        }
    }
}

impl std::fmt::Display for ThreadPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} concurrent segments x {} processor threads ({} for global stages)",
            self.segment_parallelism, self.processor_threads, self.global_threads
        )
    }
}

/// Number of cores available to this process.
pub fn host_cores() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_segments_use_all_cores() {
        let plan = ThreadPlan::derive(1, None, 16);
        assert_eq!(plan.processor_threads, 16);
        assert_eq!(plan.global_threads, 16);
    }

    #[test]
    fn test_parallel_segments_use_one_thread_each() {
        for k in 2..10 {
            let plan = ThreadPlan::derive(k, None, 16);
            assert_eq!(plan.segment_parallelism, k);
            assert_eq!(plan.processor_threads, 1);
            assert_eq!(plan.global_threads, 16);
        }
    }

    #[test]
    fn test_override_wins() {
        let plan = ThreadPlan::derive(4, Some(3), 16);
        assert_eq!(plan.processor_threads, 3);
        assert_eq!(plan.global_threads, 3);

        let plan = ThreadPlan::derive(1, Some(2), 16);
        assert_eq!(plan.processor_threads, 2);
    }

    #[test]
    fn test_zero_override_ignored() {
        assert_eq!(ThreadPlan::derive(1, Some(0), 8), ThreadPlan::derive(1, None, 8));
    }

    #[test]
    fn test_host_cores_positive() {
        assert!(host_cores() >= 1);
    }
}
