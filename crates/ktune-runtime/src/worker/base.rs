use core::time::Duration;

/// Environment variable telling a worker process which device it is bound to.
pub const WORKER_DEVICE_VAR: &str = "KTUNE_WORKER_DEVICE";

/// Error raised while talking to a worker process.
///
/// The pool never returns it: the affected request is scored `+inf` and the worker is replaced.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker process couldn't be started.
    #[error("Unable to spawn the worker: {reason}")]
    Spawn {
        /// Why the spawn failed.
        reason: String,
    },
    /// Reading from or writing to the worker failed.
    #[error("Worker I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The worker didn't answer in time.
    #[error("The worker didn't answer within {timeout:?}")]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },
    /// The worker process exited.
    #[error("The worker exited: {status}")]
    Exited {
        /// Description of the exit status.
        status: String,
    },
    /// The worker sent something unexpected.
    #[error("Worker protocol violation: {reason}")]
    Protocol {
        /// What was unexpected.
        reason: String,
    },
    /// The worker isn't bound to the device the request targets.
    #[error("Expected a worker bound to device {expected:?}, got {actual:?}")]
    DeviceMismatch {
        /// The device the request targets.
        expected: Option<u32>,
        /// The device the worker is bound to.
        actual: Option<u32>,
    },
}
