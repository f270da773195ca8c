use super::logger::{LogLevel, LoggerConfig};
use std::path::PathBuf;

/// Configuration for the autotuner, its timing harness and its persistent cache.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AutotuneConfig {
    /// Logger configuration for autotune reports.
    pub logger: LoggerConfig<AutotuneLogLevel>,

    /// How many of the offered configurations get benchmarked.
    pub level: AutotuneLevel,

    /// Where the local persistent cache lives.
    pub cache: AutotuneCache,

    /// Whether winners are persisted to and loaded from local cache files.
    pub local_cache: bool,

    /// Directory used as a shared remote store, mirrored on top of the local cache.
    pub remote_cache_dir: Option<PathBuf>,

    /// Whether the winner of the initial search is refined with coordinate descent.
    pub coordinate_descent: bool,

    /// How many steps away from the current value each axis is probed.
    pub coordinate_descent_radius: u32,

    /// Whether to sweep combined moves across every axis when single-axis moves are exhausted.
    pub coordinate_descent_check_all_directions: bool,

    /// Candidates spilling more registers than this are scored `+inf` without running.
    pub spill_threshold: u32,

    /// Disables pointwise autotuning, since benchmarking isn't deterministic.
    pub deterministic: bool,

    /// Number of helper threads used to precompile candidates, `0` uses the available parallelism.
    pub compile_threads: usize,

    /// Warmup time budget of the timing harness, in milliseconds.
    pub warmup_ms: u64,

    /// Measurement time budget of the timing harness, in milliseconds.
    pub rep_ms: u64,

    /// Whether to report the achieved bandwidth of winners.
    pub profile_bandwidth: bool,

    /// Only kernels whose name matches this regex are reported when profiling bandwidth.
    pub profile_bandwidth_regex: String,
}

impl Default for AutotuneConfig {
    fn default() -> Self {
        Self {
            logger: LoggerConfig::default(),
            level: AutotuneLevel::default(),
            cache: AutotuneCache::default(),
            local_cache: true,
            remote_cache_dir: None,
            coordinate_descent: false,
            coordinate_descent_radius: 1,
            coordinate_descent_check_all_directions: false,
            spill_threshold: 16,
            deterministic: false,
            compile_threads: 0,
            warmup_ms: 25,
            rep_ms: 100,
            profile_bandwidth: false,
            profile_bandwidth_regex: String::new(),
        }
    }
}

/// Root location of the local autotune cache.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum AutotuneCache {
    /// The current directory.
    #[serde(rename = "local")]
    Local,
    /// The `target` directory of the closest cargo project.
    #[default]
    #[serde(rename = "target")]
    Target,
    /// The user cache directory.
    #[serde(rename = "global")]
    Global,
    /// A custom directory.
    #[serde(rename = "file")]
    File(PathBuf),
}

/// Verbosity of the autotune logger.
#[derive(Default, Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub enum AutotuneLogLevel {
    /// Nothing is logged.
    #[serde(rename = "disabled")]
    Disabled,
    /// Winners and failures are logged.
    #[default]
    #[serde(rename = "minimal")]
    Minimal,
    /// Every timing is logged.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for AutotuneLogLevel {}

/// How many configurations of the offered set are benchmarked.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AutotuneLevel {
    /// Only the first (heuristic) configuration.
    #[serde(rename = "minimal")]
    Minimal,
    /// Up to 8 configurations.
    #[serde(rename = "balanced")]
    Balanced,
    /// Up to 32 configurations.
    #[serde(rename = "extensive")]
    Extensive,
    /// Every configuration.
    #[default]
    #[serde(rename = "full")]
    Full,
}

impl AutotuneLevel {
    /// The maximum number of configurations benchmarked at this level.
    pub fn max_configs(&self) -> Option<usize> {
        match self {
            AutotuneLevel::Minimal => Some(1),
            AutotuneLevel::Balanced => Some(8),
            AutotuneLevel::Extensive => Some(32),
            AutotuneLevel::Full => None,
        }
    }
}

impl AutotuneCache {
    /// The directory the cache lives in.
    pub fn root(&self) -> PathBuf {
        let current_dir = || std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        match self {
            AutotuneCache::Local => current_dir(),
            AutotuneCache::Target => {
                let dir_original = current_dir();
                let mut dir = dir_original.clone();

                loop {
                    if dir.join("Cargo.toml").is_file() {
                        return dir.join("target");
                    }

                    if !dir.pop() {
                        break;
                    }
                }

                dir_original.join("target")
            }
            AutotuneCache::Global => dirs::cache_dir().unwrap_or_else(std::env::temp_dir),
            AutotuneCache::File(path_buf) => path_buf.clone(),
        }
    }

    /// The directory holding the cache records.
    pub fn autotune_dir(&self) -> PathBuf {
        self.root().join("ktune").join("autotune")
    }
}
