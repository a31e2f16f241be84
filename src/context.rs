// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Run-wide tunables and the stop signal shared by the probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::align::{SIZE_1G, SIZE_2M, SIZE_4K};

/// Default iteration count of each alignment sub-fuzzer.
pub const DEFAULT_ALIGNMENT_ITERATIONS: u64 = 1_000_000;
/// Default number of race trials per page size.
pub const DEFAULT_RACE_TRIALS: u64 = 100_000;
/// Default number of trials between two race progress marks.
pub const DEFAULT_RACE_PROGRESS: u64 = 10_000;
/// Default number of repetitions per throughput measurement.
pub const DEFAULT_THROUGHPUT_LOOPS: u32 = 10;
/// Default IOVA at which throughput mappings are placed (above 4 GiB).
pub const DEFAULT_THROUGHPUT_IOVA: u64 = 4 * SIZE_1G;
/// Default seed of the alignment fuzzer.
pub const DEFAULT_SEED: u64 = 0x5eed_d3a5;

/// Tunables for a verification run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProbeConfig {
    /// Iterations of each alignment sub-fuzzer
    pub alignment_iterations: u64,
    /// Seed of the alignment fuzzer's generator
    pub seed: u64,
    /// Trials per race page size
    pub race_trials: u64,
    /// Trials between race progress marks; zero disables them
    pub race_progress: u64,
    /// Page sizes the race harness tries
    pub race_page_sizes: Vec<u64>,
    /// Repetitions per throughput measurement
    pub throughput_loops: u32,
    /// IOVA of throughput mappings
    pub throughput_iova: u64,
    /// Step of the huge page coalescing probe
    pub hugepage_step: u64,
    /// Extent of the page size suite when no huge page backing is given
    pub verify_extent: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            alignment_iterations: DEFAULT_ALIGNMENT_ITERATIONS,
            seed: DEFAULT_SEED,
            race_trials: DEFAULT_RACE_TRIALS,
            race_progress: DEFAULT_RACE_PROGRESS,
            race_page_sizes: vec![SIZE_2M, SIZE_1G],
            throughput_loops: DEFAULT_THROUGHPUT_LOOPS,
            throughput_iova: DEFAULT_THROUGHPUT_IOVA,
            hugepage_step: SIZE_4K,
            verify_extent: SIZE_2M,
        }
    }
}

impl ProbeConfig {
    /// Override the alignment fuzzer iteration count.
    pub fn with_alignment_iterations(mut self, iterations: u64) -> Self {
        self.alignment_iterations = iterations;
        self
    }

    /// Override the alignment fuzzer seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Override the number of race trials.
    pub fn with_race_trials(mut self, trials: u64) -> Self {
        self.race_trials = trials;
        self
    }

    /// Override the race page sizes.
    pub fn with_race_page_sizes(mut self, sizes: Vec<u64>) -> Self {
        self.race_page_sizes = sizes;
        self
    }

    /// Override the throughput repetitions.
    pub fn with_throughput_loops(mut self, loops: u32) -> Self {
        self.throughput_loops = loops;
        self
    }

    /// Override the default page size suite extent.
    pub fn with_verify_extent(mut self, extent: u64) -> Self {
        self.verify_extent = extent;
        self
    }
}

/// State shared by every probe of one run.
///
/// Cloning a context shares its stop flag, so a signal handler or watchdog holding one clone can
/// end the long loops of every probe driven by the others.
#[derive(Clone, Debug, Default)]
pub struct RunContext {
    config: ProbeConfig,
    stop: Arc<AtomicBool>,
}

impl RunContext {
    /// Create a context with the given tunables.
    pub fn new(config: ProbeConfig) -> Self {
        RunContext {
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Tunables of the run.
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Ask every probe sharing this context to stop at its next check.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Whether a stop was requested.
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// The stop flag, for handing to code outside the probes.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProbeConfig::default();
        assert_eq!(config.alignment_iterations, 1_000_000);
        assert_eq!(config.race_trials, 100_000);
        assert_eq!(config.race_page_sizes, vec![SIZE_2M, SIZE_1G]);
        assert_eq!(config.throughput_iova, 0x1_0000_0000);

        let config = config.with_seed(7).with_race_trials(10);
        assert_eq!((config.seed, config.race_trials), (7, 10));
    }

    #[test]
    fn test_stop_is_per_context() {
        let a = RunContext::new(ProbeConfig::default());
        let b = RunContext::new(ProbeConfig::default());
        let a2 = a.clone();

        a2.request_stop();
        assert!(a.should_stop());
        assert!(!b.should_stop());
        assert!(a.stop_flag().load(Ordering::Relaxed));
    }
}
