use super::logger::{LogLevel, LoggerConfig};
use std::path::PathBuf;

/// Configuration of the benchmark worker pool.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Logger configuration for worker lifecycle events.
    pub logger: LoggerConfig<WorkerLogLevel>,

    /// Spawn one worker per device instead of a single worker for every device.
    pub device_isolation: bool,

    /// Time allowed for a single benchmark request before the worker is considered hung.
    pub timeout_ms: u64,

    /// Time allowed for a freshly spawned worker to announce itself.
    pub spawn_timeout_ms: u64,

    /// Environment variable restricting which physical devices a worker sees.
    pub visibility_var: String,

    /// Worker executable. Defaults to `ktune-worker` next to the current executable.
    pub program: Option<PathBuf>,

    /// Extra arguments passed to the worker executable.
    pub args: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            logger: LoggerConfig::default(),
            device_isolation: true,
            timeout_ms: 30_000,
            spawn_timeout_ms: 60_000,
            visibility_var: "CUDA_VISIBLE_DEVICES".to_string(),
            program: None,
            args: Vec::new(),
        }
    }
}

/// Verbosity of the worker pool logger.
#[derive(Default, Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub enum WorkerLogLevel {
    /// Nothing is logged.
    #[serde(rename = "disabled")]
    Disabled,
    /// Crashes, timeouts and respawns are logged.
    #[default]
    #[serde(rename = "minimal")]
    Minimal,
    /// Every request is logged.
    #[serde(rename = "full")]
    Full,
}

impl LogLevel for WorkerLogLevel {}
