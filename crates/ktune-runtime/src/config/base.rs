use super::{autotune::AutotuneConfig, worker::WorkerConfig};
use std::path::Path;
use std::sync::Arc;

/// Static mutex holding the global configuration, initialized as `None`.
static KTUNE_GLOBAL_CONFIG: spin::Mutex<Option<Arc<GlobalConfig>>> = spin::Mutex::new(None);

/// Names of the configuration files searched in the current directory and its parents.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["ktune.toml", "KTune.toml"];

/// Error raised while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file couldn't be read.
    #[error("Unable to read the configuration file\nCaused by:\n  {0}")]
    Io(#[from] std::io::Error),
    /// The file isn't valid toml or doesn't match the expected layout.
    #[error("The configuration file doesn't have the right format\nCaused by:\n  {0}")]
    Parse(#[from] toml::de::Error),
}

/// Represents the global configuration of the autotuning engine.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct GlobalConfig {
    /// Configuration for the autotuner, the harness and the persistent cache.
    #[serde(default)]
    pub autotune: AutotuneConfig,

    /// Configuration for the benchmark worker pool.
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl GlobalConfig {
    /// Retrieves the current global configuration, loading it from the current directory if not set.
    ///
    /// If no configuration is set, it attempts to load one from `ktune.toml` or `KTune.toml` in the
    /// current directory or its parents, then applies environment overrides. If no file is found,
    /// a default configuration is used.
    ///
    /// # Notes
    ///
    /// This takes a global lock. Components read it once while being built (see
    /// [AutotuneOptions::from_config](crate::tune::AutotuneOptions::from_config)) and keep their
    /// own copy of the values they need.
    pub fn get() -> Arc<Self> {
        let mut state = KTUNE_GLOBAL_CONFIG.lock();

        match state.as_ref() {
            Some(config) => config.clone(),
            None => {
                let config = Arc::new(Self::from_current_dir().override_from_env());
                *state = Some(config.clone());
                config
            }
        }
    }

    /// Save the current configuration to the provided file path.
    pub fn save_default<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
        let config = Self::get();
        let content = toml::to_string_pretty(config.as_ref())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        std::fs::write(path, content)
    }

    /// Sets the global configuration to the provided value.
    ///
    /// # Panics
    /// Panics if the configuration has already been set or read, as it cannot be overridden.
    ///
    /// # Warning
    /// This method must be called at the start of the program, before any calls to `get`.
    pub fn set(config: Self) {
        let mut state = KTUNE_GLOBAL_CONFIG.lock();
        if state.is_some() {
            panic!("Cannot set the global configuration multiple times.");
        }
        *state = Some(Arc::new(config));
    }

    /// Overrides configuration fields based on environment variables.
    pub fn override_from_env(self) -> Self {
        self.override_from(|name| std::env::var(name).ok())
    }

    /// Overrides configuration fields from the given variable lookup.
    pub fn override_from<F: Fn(&str) -> Option<String>>(mut self, lookup: F) -> Self {
        use super::autotune::{AutotuneCache, AutotuneLevel, AutotuneLogLevel};
        use super::worker::WorkerLogLevel;

        if let Some(val) = lookup("KTUNE_DEBUG_LOG") {
            self.autotune.logger.level = AutotuneLogLevel::Full;
            self.worker.logger.level = WorkerLogLevel::Full;

            match val.as_str() {
                "stdout" => {
                    self.autotune.logger.stdout = true;
                    self.worker.logger.stdout = true;
                }
                "stderr" => {
                    self.autotune.logger.stderr = true;
                    self.worker.logger.stderr = true;
                }
                "1" | "true" => {
                    let file_path = std::env::temp_dir().join("ktune.log");
                    self.autotune.logger.file = Some(file_path.clone());
                    self.worker.logger.file = Some(file_path);
                }
                "0" | "false" => {
                    self.autotune.logger.level = AutotuneLogLevel::Disabled;
                    self.worker.logger.level = WorkerLogLevel::Disabled;
                }
                file_path => {
                    self.autotune.logger.file = Some(file_path.into());
                    self.worker.logger.file = Some(file_path.into());
                }
            }
        };

        if let Some(val) = lookup("KTUNE_AUTOTUNE_LEVEL") {
            match val.as_str() {
                "minimal" | "0" => self.autotune.level = AutotuneLevel::Minimal,
                "balanced" | "1" => self.autotune.level = AutotuneLevel::Balanced,
                "extensive" | "2" => self.autotune.level = AutotuneLevel::Extensive,
                "full" | "3" => self.autotune.level = AutotuneLevel::Full,
                _ => log::warn!("Ignoring unknown KTUNE_AUTOTUNE_LEVEL value {val:?}"),
            }
        }

        if let Some(val) = lookup("KTUNE_COORDINATE_DESCENT") {
            if let Some(enabled) = parse_flag(&val) {
                self.autotune.coordinate_descent = enabled;
            }
        }

        if let Some(val) = lookup("KTUNE_AUTOTUNE_CACHE") {
            self.autotune.cache = match val.as_str() {
                "local" => AutotuneCache::Local,
                "target" => AutotuneCache::Target,
                "global" => AutotuneCache::Global,
                path => AutotuneCache::File(path.into()),
            };
        }

        if let Some(val) = lookup("KTUNE_WORKER_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(timeout) => self.worker.timeout_ms = timeout,
                Err(_) => log::warn!("Ignoring invalid KTUNE_WORKER_TIMEOUT_MS value {val:?}"),
            }
        }

        if let Some(val) = lookup("KTUNE_DEVICE_ISOLATION") {
            if let Some(enabled) = parse_flag(&val) {
                self.worker.device_isolation = enabled;
            }
        }

        self
    }

    // Loads configuration from `ktune.toml` or `KTune.toml` in the current directory or its parents.
    //
    // Traverses up the directory tree until a valid configuration file is found or the root is reached.
    // A file that exists but can't be parsed is reported and skipped.
    fn from_current_dir() -> Self {
        let mut dir = match std::env::current_dir() {
            Ok(dir) => dir,
            Err(_) => return Self::default(),
        };

        loop {
            for name in CONFIG_FILE_NAMES {
                let path = dir.join(name);
                if !path.is_file() {
                    continue;
                }

                match Self::from_file_path(&path) {
                    Ok(config) => return config,
                    Err(err) => log::warn!("Ignoring configuration file {path:?}: {err}"),
                }
            }

            if !dir.pop() {
                break;
            }
        }

        Self::default()
    }

    /// Loads configuration from a specified file path.
    pub fn from_file_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => {
            log::warn!("Ignoring invalid boolean flag value {value:?}");
            None
        }
    }
}
