use super::{WORKER_DEVICE_VAR, WorkerError, WorkerMessage, WorkerReply, decode, encode};
use crate::config::worker::WorkerConfig;
use core::time::Duration;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

/// Name of the bundled worker executable.
pub const WORKER_PROGRAM: &str = "ktune-worker";

/// A live connection to one worker.
pub trait WorkerConnection: Send {
    /// Send a message.
    fn send(&mut self, message: &WorkerMessage) -> Result<(), WorkerError>;

    /// Wait for the next reply.
    fn recv_timeout(&mut self, timeout: Duration) -> Result<WorkerReply, WorkerError>;

    /// Stop the worker immediately.
    fn kill(&mut self);

    /// Identifier of the worker, e.g. its process id.
    fn id(&self) -> u32;
}

/// Starts workers bound to a device, or to every device when `None`.
pub trait WorkerSpawner: Send + Sync {
    /// Start a worker.
    fn spawn(&self, device: Option<u32>) -> Result<Box<dyn WorkerConnection>, WorkerError>;
}

/// Spawns workers as child processes talking JSON lines over their standard streams.
///
/// Each worker only sees its own device through the visibility variable. Its standard error is
/// inherited so worker logs reach the parent's terminal.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
    visibility_var: String,
}

impl ProcessSpawner {
    /// Spawn the given executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            visibility_var: WorkerConfig::default().visibility_var,
        }
    }

    /// Pass extra arguments to the executable.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the variable restricting which devices a worker sees.
    pub fn with_visibility_var(mut self, name: impl Into<String>) -> Self {
        self.visibility_var = name.into();
        self
    }

    /// Spawner described by the worker configuration.
    ///
    /// Without an explicit program, `ktune-worker` is looked up next to the current executable.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let program = match config.program.as_ref() {
            Some(program) => program.clone(),
            None => {
                let exe = std::env::current_exe()?;
                let dir = exe.parent().ok_or_else(|| WorkerError::Spawn {
                    reason: format!("{exe:?} has no parent directory"),
                })?;
                dir.join(format!("{WORKER_PROGRAM}{}", std::env::consts::EXE_SUFFIX))
            }
        };

        Ok(Self::new(program)
            .with_args(config.args.iter().cloned())
            .with_visibility_var(config.visibility_var.clone()))
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, device: Option<u32>) -> Result<Box<dyn WorkerConnection>, WorkerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        match device {
            Some(device) => {
                command
                    .env(&self.visibility_var, device.to_string())
                    .env(WORKER_DEVICE_VAR, device.to_string());
            }
            None => {
                command.env_remove(WORKER_DEVICE_VAR);
            }
        }

        let mut child = command.spawn().map_err(|err| WorkerError::Spawn {
            reason: format!("{:?}: {err}", self.program),
        })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                child.kill().ok();
                child.wait().ok();
                return Err(WorkerError::Spawn {
                    reason: "The worker standard streams aren't piped".to_string(),
                });
            }
        };

        let (sender, replies) = crossbeam::channel::unbounded();
        let reader = std::thread::Builder::new()
            .name(format!("ktune-worker-{}", child.id()))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if sender.send(line).is_err() {
                        break;
                    }
                }
            });

        let reader = match reader {
            Ok(reader) => reader,
            Err(err) => {
                child.kill().ok();
                child.wait().ok();
                return Err(err.into());
            }
        };

        Ok(Box::new(ProcessConnection {
            child,
            stdin: Some(stdin),
            replies,
            reader: Some(reader),
        }))
    }
}

struct ProcessConnection {
    child: Child,
    stdin: Option<ChildStdin>,
    replies: Receiver<String>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessConnection {
    fn exit_error(&mut self) -> WorkerError {
        // The pipe closes slightly before the process is reaped.
        let status = match self.child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                std::thread::sleep(Duration::from_millis(50));
                self.child.try_wait().ok().flatten()
            }
        };

        WorkerError::Exited {
            status: match status {
                Some(status) => describe_exit(status),
                None => "standard output closed".to_string(),
            },
        }
    }
}

impl WorkerConnection for ProcessConnection {
    fn send(&mut self, message: &WorkerMessage) -> Result<(), WorkerError> {
        let line = encode(message)?;
        let stdin = self.stdin.as_mut().ok_or_else(|| WorkerError::Exited {
            status: "standard input closed".to_string(),
        })?;

        stdin.write_all(line.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<WorkerReply, WorkerError> {
        match self.replies.recv_timeout(timeout) {
            Ok(line) => decode(&line),
            Err(RecvTimeoutError::Timeout) => Err(WorkerError::Timeout { timeout }),
            Err(RecvTimeoutError::Disconnected) => Err(self.exit_error()),
        }
    }

    fn kill(&mut self) {
        self.stdin.take();
        if let Ok(None) = self.child.try_wait() {
            self.child.kill().ok();
        }
        self.child.wait().ok();

        if let Some(reader) = self.reader.take() {
            reader.join().ok();
        }
    }

    fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for ProcessConnection {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Human readable exit status, naming the signal that killed the process when there is one.
pub fn describe_exit(status: ExitStatus) -> String {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            use std::os::unix::process::ExitStatusExt;

            if let Some(signal) = status.signal() {
                return format!("killed by signal {signal}");
            }
        }
    }

    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "unknown exit status".to_string(),
    }
}
