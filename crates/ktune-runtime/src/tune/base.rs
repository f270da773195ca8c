use super::{LaunchError, TimingHarness};
use crate::config::autotune::AutotuneConfig;
use core::time::Duration;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Name of the reduction block parameter, halved when reductions can't reach full occupancy.
pub const REDUCTION_BLOCK: &str = "RBLOCK";

/// Name of the block parameter along the non-reduced dimension.
pub const X_BLOCK: &str = "XBLOCK";

/// Size hint holding the number of elements along the non-reduced dimension.
pub const X_NUMEL: &str = "xnumel";

/// Smallest reduction block that is still halved.
const MIN_RESCALED_REDUCTION_BLOCK: u32 = 64;

/// The heuristic that produced a kernel's candidate set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeuristicKind {
    /// Elementwise kernels.
    Pointwise,
    /// Reductions looping over the reduced dimension.
    Reduction,
    /// Reductions holding the whole reduced dimension in one block.
    PersistentReduction,
    /// Template kernels, e.g. matrix multiplications, tuned among a fixed set of choices.
    Template,
    /// Kernels whose configurations were provided by the user.
    UserAutotune,
}

impl HeuristicKind {
    /// Whether coordinate descent may move away from the offered configurations.
    pub fn supports_local_search(&self) -> bool {
        !matches!(self, HeuristicKind::Template | HeuristicKind::UserAutotune)
    }
}

/// Error surfaced to callers of the [autotuner](super::CachingAutotuner).
#[derive(Debug, thiserror::Error)]
pub enum AutotuneError {
    /// The autotuner was created without any configuration.
    #[error("At least one configuration is needed to autotune a kernel")]
    EmptyConfigurationSet,
    /// No configuration could be compiled.
    #[error("Every configuration of kernel {kernel} is infeasible")]
    AllCandidatesInfeasible {
        /// The kernel name.
        kernel: String,
    },
    /// Every candidate failed or crashed while benchmarking.
    #[error("No viable configuration for kernel {kernel}, every candidate failed to benchmark")]
    NoViableConfiguration {
        /// The kernel name.
        kernel: String,
    },
    /// The winner failed while running.
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Options of the autotuner, usually built from the [global configuration](crate::config::GlobalConfig).
#[derive(Clone, Debug)]
pub struct AutotuneOptions {
    /// Maximum number of offered configurations benchmarked, `None` benchmarks all of them.
    pub max_configs: Option<usize>,
    /// Refine the winner with coordinate descent.
    pub coordinate_descent: bool,
    /// Radius of the coordinate descent neighborhood.
    pub coordinate_descent_radius: u32,
    /// Sweep combined moves when single-axis moves are exhausted.
    pub check_all_directions: bool,
    /// Candidates spilling more registers are scored `+inf` without running.
    pub spill_threshold: u32,
    /// Only benchmark the first configuration of pointwise kernels.
    pub deterministic: bool,
    /// Threads used to precompile candidates, `0` uses the available parallelism.
    pub compile_threads: usize,
    /// The local timing harness.
    pub harness: TimingHarness,
    /// Report the achieved bandwidth of winners whose kernel name matches.
    pub profile_bandwidth: Option<Regex>,
}

impl Default for AutotuneOptions {
    fn default() -> Self {
        Self::from_config(&AutotuneConfig::default())
    }
}

impl AutotuneOptions {
    /// Build the options from the autotune configuration.
    pub fn from_config(config: &AutotuneConfig) -> Self {
        let profile_bandwidth = match config.profile_bandwidth {
            true => match Regex::new(&config.profile_bandwidth_regex) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    log::warn!("Bandwidth profiling disabled, invalid kernel name regex: {err}");
                    None
                }
            },
            false => None,
        };

        Self {
            max_configs: config.level.max_configs(),
            coordinate_descent: config.coordinate_descent,
            coordinate_descent_radius: config.coordinate_descent_radius,
            check_all_directions: config.coordinate_descent_check_all_directions,
            spill_threshold: config.spill_threshold,
            deterministic: config.deterministic,
            compile_threads: config.compile_threads,
            harness: TimingHarness {
                warmup: Duration::from_millis(config.warmup_ms),
                rep: Duration::from_millis(config.rep_ms),
                ..Default::default()
            },
            profile_bandwidth,
        }
    }

    /// Whether coordinate descent runs for kernels produced by the given heuristic.
    pub fn local_search_enabled(&self, heuristic: HeuristicKind) -> bool {
        self.coordinate_descent && heuristic.supports_local_search()
    }
}

/// Whether a reduction candidate should be retried with a halved reduction block.
///
/// Happens when each thread needs more registers than the device can give at full occupancy,
/// and the grid has more blocks than the device can keep resident at once.
pub(crate) fn needs_smaller_reduction_block(
    reduction_block: u32,
    x_block: u32,
    registers: u32,
    parallelism_width: u32,
    xnumel: u64,
    device: &super::DeviceProperties,
) -> bool {
    if reduction_block <= MIN_RESCALED_REDUCTION_BLOCK || registers == 0 {
        return false;
    }

    let max_threads = device.max_threads_per_multiprocessor.max(1);
    if registers <= device.regs_per_multiprocessor / max_threads {
        return false;
    }

    let regs_per_block = registers as u64 * device.warp_size as u64 * parallelism_width as u64;
    let max_blocks_per_sm = (device.regs_per_multiprocessor as u64 / regs_per_block.max(1)).max(1);
    let total_blocks = xnumel.div_ceil(x_block.max(1) as u64);

    total_blocks > max_blocks_per_sm * device.multiprocessor_count as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::autotune::AutotuneLevel;
    use crate::tune::DeviceProperties;

    fn device() -> DeviceProperties {
        DeviceProperties::new(65536, 2048, 108, 32)
    }

    #[test_log::test]
    fn options_follow_the_config() {
        let config = AutotuneConfig {
            level: AutotuneLevel::Minimal,
            coordinate_descent: true,
            warmup_ms: 5,
            profile_bandwidth: true,
            profile_bandwidth_regex: "^triton_".into(),
            ..Default::default()
        };

        let options = AutotuneOptions::from_config(&config);

        assert_eq!(options.max_configs, Some(1));
        assert!(options.local_search_enabled(HeuristicKind::Pointwise));
        assert!(!options.local_search_enabled(HeuristicKind::Template));
        assert_eq!(options.harness.warmup, Duration::from_millis(5));
        assert!(options.profile_bandwidth.unwrap().is_match("triton_red_0"));
    }

    #[test_log::test]
    fn invalid_profiling_regex_disables_profiling() {
        let config = AutotuneConfig {
            profile_bandwidth: true,
            profile_bandwidth_regex: "(".into(),
            ..Default::default()
        };

        assert!(AutotuneOptions::from_config(&config).profile_bandwidth.is_none());
    }

    #[test_log::test]
    fn register_hungry_large_reductions_are_rescaled() {
        // 64 registers per thread with 8 warps: 4 blocks per SM, 432 resident blocks.
        assert!(needs_smaller_reduction_block(256, 1, 64, 8, 1_000_000, &device()));
        assert!(!needs_smaller_reduction_block(256, 1, 64, 8, 400, &device()));
        assert!(!needs_smaller_reduction_block(64, 1, 64, 8, 1_000_000, &device()));
        assert!(!needs_smaller_reduction_block(256, 1, 32, 8, 1_000_000, &device()));
    }
}
