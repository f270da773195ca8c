use super::GlobalConfig;
use super::{autotune::AutotuneLogLevel, worker::WorkerLogLevel};
use core::fmt::Display;
use hashbrown::HashMap;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
    sync::Arc,
};

/// Configuration for one logging channel, parameterized by a log level type.
///
/// Note that you can use multiple sinks at the same time.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(bound = "")]
pub struct LoggerConfig<L: LogLevel> {
    /// Path to the log file, if file logging is enabled.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Whether to append to the log file (true) or overwrite it (false). Defaults to true.
    #[serde(default = "append_default")]
    pub append: bool,

    /// Whether to log to standard output.
    #[serde(default)]
    pub stdout: bool,

    /// Whether to log to standard error.
    #[serde(default)]
    pub stderr: bool,

    /// Optional crate-level logging configuration (e.g., info, debug, trace).
    #[serde(default)]
    pub log: Option<LogCrateLevel>,

    /// The log level for this logger, determining verbosity.
    #[serde(default)]
    pub level: L,
}

impl<L: LogLevel> Default for LoggerConfig<L> {
    fn default() -> Self {
        Self {
            file: None,
            append: true,
            stdout: false,
            stderr: false,
            log: None,
            level: L::default(),
        }
    }
}

/// Log levels using the `log` crate.
#[derive(
    Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize, Hash, PartialEq, Eq,
)]
pub enum LogCrateLevel {
    /// Logs informational messages.
    #[default]
    #[serde(rename = "info")]
    Info,

    /// Logs debugging messages.
    #[serde(rename = "debug")]
    Debug,

    /// Logs trace-level messages.
    #[serde(rename = "trace")]
    Trace,
}

fn append_default() -> bool {
    true
}

/// Trait for types that can be used as log levels in `LoggerConfig`.
pub trait LogLevel:
    serde::de::DeserializeOwned + serde::Serialize + Clone + Copy + core::fmt::Debug + Default
{
}

/// Central logging utility, managing multiple log outputs for the autotune and worker channels.
#[derive(Debug)]
pub struct Logger {
    /// Collection of logger instances (file, stdout, stderr, or crate-level).
    loggers: Vec<LoggerKind>,

    /// Indices of loggers used for autotuning logging.
    autotune_index: Vec<usize>,

    /// Indices of loggers used for worker pool logging.
    worker_index: Vec<usize>,

    /// Configuration the loggers were created from.
    pub config: Arc<GlobalConfig>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Hash, PartialEq, Eq)]
enum LoggerId {
    File(PathBuf),
    Stdout,
    Stderr,
    LogCrate(LogCrateLevel),
}

impl Logger {
    /// Creates a new `Logger` instance based on the global configuration.
    ///
    /// Note that creating a logger is quite expensive.
    pub fn new() -> Self {
        Self::from_config(GlobalConfig::get())
    }

    /// Creates a logger that drops every message.
    pub fn disabled() -> Self {
        let mut config = GlobalConfig::default();
        config.autotune.logger.level = AutotuneLogLevel::Disabled;
        config.worker.logger.level = WorkerLogLevel::Disabled;

        Self::from_config(Arc::new(config))
    }

    /// Creates a new `Logger` from the provided configuration.
    pub fn from_config(config: Arc<GlobalConfig>) -> Self {
        let mut loggers = Vec::new();
        let mut logger2index = HashMap::<LoggerId, usize>::new();
        let mut autotune_index = Vec::new();
        let mut worker_index = Vec::new();

        if !matches!(config.autotune.logger.level, AutotuneLogLevel::Disabled) {
            register_logger(
                &config.autotune.logger,
                &mut autotune_index,
                &mut loggers,
                &mut logger2index,
            );
        }

        if !matches!(config.worker.logger.level, WorkerLogLevel::Disabled) {
            register_logger(
                &config.worker.logger,
                &mut worker_index,
                &mut loggers,
                &mut logger2index,
            );
        }

        Self {
            loggers,
            autotune_index,
            worker_index,
            config,
        }
    }

    /// Logs a message for autotuning, directing it to all configured autotuning loggers.
    pub fn log_autotune<S: Display>(&mut self, msg: &S) {
        let indices = self.autotune_index.clone();
        self.log_all(msg, &indices);
    }

    /// Logs a message for the worker pool, directing it to all configured worker loggers.
    pub fn log_worker<S: Display>(&mut self, msg: &S) {
        let indices = self.worker_index.clone();
        self.log_all(msg, &indices);
    }

    /// Returns the current autotune log level.
    pub fn log_level_autotune(&self) -> AutotuneLogLevel {
        self.config.autotune.logger.level
    }

    /// Returns the current worker pool log level.
    pub fn log_level_worker(&self) -> WorkerLogLevel {
        self.config.worker.logger.level
    }

    fn log_all<S: Display>(&mut self, msg: &S, indices: &[usize]) {
        match indices {
            [] => {}
            [index] => self.loggers[*index].log(msg),
            indices => {
                let msg = msg.to_string();
                for index in indices {
                    self.loggers[*index].log(&msg);
                }
            }
        }
    }
}

fn register_logger<L: LogLevel>(
    kind: &LoggerConfig<L>,
    setting_index: &mut Vec<usize>,
    loggers: &mut Vec<LoggerKind>,
    logger2index: &mut HashMap<LoggerId, usize>,
) {
    let mut register = |id: LoggerId, create: &dyn Fn() -> Option<LoggerKind>| {
        if let Some(index) = logger2index.get(&id) {
            setting_index.push(*index);
        } else if let Some(logger) = create() {
            let index = loggers.len();
            logger2index.insert(id, index);
            loggers.push(logger);
            setting_index.push(index);
        }
    };

    if let Some(file) = &kind.file {
        register(LoggerId::File(file.clone()), &|| {
            match FileLogger::new(file, kind.append) {
                Ok(logger) => Some(LoggerKind::File(logger)),
                Err(err) => {
                    log::warn!("Unable to open log file {file:?}, file logging disabled: {err}");
                    None
                }
            }
        });
    }

    if kind.stdout {
        register(LoggerId::Stdout, &|| Some(LoggerKind::Stdout));
    }

    if kind.stderr {
        register(LoggerId::Stderr, &|| Some(LoggerKind::Stderr));
    }

    if let Some(level) = kind.log {
        register(LoggerId::LogCrate(level), &|| Some(LoggerKind::Log(level)));
    }
}

/// Represents different types of loggers.
#[derive(Debug)]
enum LoggerKind {
    /// Logs to a file.
    File(FileLogger),

    /// Logs to standard output.
    Stdout,

    /// Logs to standard error.
    Stderr,

    /// Logs using the `log` crate with a specified level.
    Log(LogCrateLevel),
}

impl LoggerKind {
    fn log<S: Display>(&mut self, msg: &S) {
        match self {
            LoggerKind::File(file_logger) => file_logger.log(msg),
            LoggerKind::Stdout => println!("{msg}"),
            LoggerKind::Stderr => eprintln!("{msg}"),
            LoggerKind::Log(level) => match level {
                LogCrateLevel::Info => log::info!("{msg}"),
                LogCrateLevel::Debug => log::debug!("{msg}"),
                LogCrateLevel::Trace => log::trace!("{msg}"),
            },
        }
    }
}

/// Logger that writes messages to a file.
#[derive(Debug)]
struct FileLogger {
    writer: BufWriter<File>,
}

impl FileLogger {
    fn new(path: &PathBuf, append: bool) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let file = OpenOptions::new()
            .write(true)
            .append(append)
            .truncate(!append)
            .create(true)
            .open(path)?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    // Logging must never take the autotuner down, write failures are dropped.
    fn log<S: Display>(&mut self, msg: &S) {
        if writeln!(self.writer, "{msg}").is_ok() {
            self.writer.flush().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn channels_share_a_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ktune.log");
        let mut config = GlobalConfig::default();
        config.autotune.logger.file = Some(path.clone());
        config.worker.logger.file = Some(path.clone());

        let mut logger = Logger::from_config(Arc::new(config));
        logger.log_autotune(&"winner");
        logger.log_worker(&"respawn");

        assert_eq!(logger.loggers.len(), 1);
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content, "winner\nrespawn\n");
    }

    #[test_log::test]
    fn disabled_logger_has_no_sinks() {
        let mut logger = Logger::disabled();
        logger.log_autotune(&"ignored");

        assert!(logger.loggers.is_empty());
    }
}
