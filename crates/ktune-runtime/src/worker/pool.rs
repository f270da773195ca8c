use super::{
    BenchmarkRequest, ProcessSpawner, WorkerConnection, WorkerError, WorkerMessage, WorkerReply,
    WorkerSpawner,
};
use crate::config::worker::{WorkerConfig, WorkerLogLevel};
use crate::config::Logger;
use crate::tune::{Candidate, CandidateBenchmark, KernelSpec, TimingHarness, TuneInputs};
use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Options of a [worker pool](WorkerPool).
#[derive(Clone, Debug, PartialEq)]
pub struct PoolOptions {
    /// One worker per device instead of a single worker for every device.
    pub device_isolation: bool,
    /// Time allowed for one request.
    pub timeout: Duration,
    /// Time allowed for a new worker to announce itself.
    pub spawn_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl PoolOptions {
    /// Build the options from the worker configuration.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            device_isolation: config.device_isolation,
            timeout: Duration::from_millis(config.timeout_ms),
            spawn_timeout: Duration::from_millis(config.spawn_timeout_ms),
        }
    }
}

/// Lifecycle of a worker: `Spawning → Ready → (InFlight ↔ Ready) → Dead`, then a new instance
/// starts `Spawning` again on next use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// The process is starting and hasn't announced itself yet.
    Spawning,
    /// Waiting for a request.
    Ready,
    /// Executing a request.
    InFlight,
    /// No live process; one is spawned on next use.
    Dead,
}

struct WorkerSlot {
    device: Option<u32>,
    state: spin::Mutex<WorkerState>,
    connection: Mutex<Option<Box<dyn WorkerConnection>>>,
}

impl WorkerSlot {
    fn new(device: Option<u32>) -> Self {
        Self {
            device,
            state: spin::Mutex::new(WorkerState::Dead),
            connection: Mutex::new(None),
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }
}

/// Benchmarks requests in isolated worker processes.
///
/// Requests targeting different devices run in parallel, requests for the same device run one at
/// a time. A worker that crashes, hangs or misbehaves only costs the request it was executing,
/// which is scored `+inf`; a replacement is spawned on next use.
pub struct WorkerPool {
    spawner: Arc<dyn WorkerSpawner>,
    options: PoolOptions,
    slots: Mutex<Vec<Arc<WorkerSlot>>>,
    logger: Arc<spin::Mutex<Logger>>,
}

impl core::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("options", &self.options)
            .field("workers", &self.worker_states())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool. No worker is started until [initialize](Self::initialize) or the first
    /// benchmark.
    pub fn new<S: WorkerSpawner + 'static>(spawner: S, options: PoolOptions) -> Self {
        Self {
            spawner: Arc::new(spawner),
            options,
            slots: Mutex::new(Vec::new()),
            logger: Arc::new(spin::Mutex::new(Logger::disabled())),
        }
    }

    /// Create a pool spawning the configured worker executable.
    pub fn from_config(config: &WorkerConfig) -> Result<Self, WorkerError> {
        Ok(Self::new(
            ProcessSpawner::from_config(config)?,
            PoolOptions::from_config(config),
        ))
    }

    /// Set the logger.
    pub fn with_logger(mut self, logger: Arc<spin::Mutex<Logger>>) -> Self {
        self.logger = logger;
        self
    }

    /// The pool options.
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Start one worker per device, or a single worker when device isolation is disabled.
    pub fn initialize(&self, devices: &[Option<u32>]) -> Result<(), WorkerError> {
        let mut keys: Vec<Option<u32>> = devices.iter().map(|device| self.slot_key(*device)).collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            keys.push(None);
        }

        for key in keys {
            let slot = self.slot(key);
            let mut connection = slot.connection.lock().unwrap_or_else(PoisonError::into_inner);
            if connection.is_none() {
                *connection = Some(self.spawn(&slot)?);
            }
        }

        Ok(())
    }

    /// Latency of every request in milliseconds, in request order.
    ///
    /// Never fails: a request whose worker crashed, hung or answered incorrectly is `+inf`.
    pub fn benchmark(&self, requests: &[BenchmarkRequest]) -> Vec<f64> {
        let mut groups: BTreeMap<Option<u32>, Vec<usize>> = BTreeMap::new();
        for (index, request) in requests.iter().enumerate() {
            groups
                .entry(self.slot_key(request.expected_device))
                .or_default()
                .push(index);
        }

        let work: Vec<(Arc<WorkerSlot>, Vec<usize>)> = groups
            .into_iter()
            .map(|(key, indices)| (self.slot(key), indices))
            .collect();

        let mut latencies = vec![f64::INFINITY; requests.len()];

        std::thread::scope(|scope| {
            let handles: Vec<_> = work
                .iter()
                .map(|(slot, indices)| {
                    scope.spawn(move || {
                        indices
                            .iter()
                            .map(|index| (*index, self.run_on(slot, &requests[*index])))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            for handle in handles {
                if let Ok(results) = handle.join() {
                    for (index, latency) in results {
                        latencies[index] = latency;
                    }
                }
            }
        });

        latencies
    }

    /// Stop every worker. Safe to call multiple times, the pool spawns new workers if used again.
    pub fn terminate(&self) {
        let slots: Vec<Arc<WorkerSlot>> = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.drain(..).collect()
        };

        for slot in slots {
            let mut connection = slot.connection.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(mut worker) = connection.take() {
                worker.send(&WorkerMessage::Shutdown).ok();
                worker.kill();
                self.log(
                    WorkerLogLevel::Full,
                    format!("Stopped worker {} ({})", worker.id(), device_name(slot.device)),
                );
            }
            slot.set_state(WorkerState::Dead);
        }
    }

    /// The device and state of every worker.
    pub fn worker_states(&self) -> Vec<(Option<u32>, WorkerState)> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|slot| (slot.device, *slot.state.lock()))
            .collect()
    }

    fn slot_key(&self, device: Option<u32>) -> Option<u32> {
        match self.options.device_isolation {
            true => device,
            false => None,
        }
    }

    // Slots are unique per key, so two workers are never bound to the same device.
    fn slot(&self, key: Option<u32>) -> Arc<WorkerSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);

        match slots.iter().find(|slot| slot.device == key) {
            Some(slot) => slot.clone(),
            None => {
                let slot = Arc::new(WorkerSlot::new(key));
                slots.push(slot.clone());
                slot
            }
        }
    }

    fn spawn(&self, slot: &WorkerSlot) -> Result<Box<dyn WorkerConnection>, WorkerError> {
        slot.set_state(WorkerState::Spawning);

        let mut worker = match self.spawner.spawn(slot.device) {
            Ok(worker) => worker,
            Err(err) => {
                slot.set_state(WorkerState::Dead);
                return Err(err);
            }
        };

        let handshake = match worker.recv_timeout(self.options.spawn_timeout) {
            Ok(WorkerReply::Ready { device, pid }) if device == slot.device => Ok(pid),
            Ok(WorkerReply::Ready { device, .. }) => Err(WorkerError::DeviceMismatch {
                expected: slot.device,
                actual: device,
            }),
            Ok(reply) => Err(WorkerError::Protocol {
                reason: format!("Expected a ready message, got {reply:?}"),
            }),
            Err(err) => Err(err),
        };

        match handshake {
            Ok(pid) => {
                slot.set_state(WorkerState::Ready);
                self.log(
                    WorkerLogLevel::Minimal,
                    format!("Spawned worker {pid} ({})", device_name(slot.device)),
                );
                Ok(worker)
            }
            Err(err) => {
                worker.kill();
                slot.set_state(WorkerState::Dead);
                Err(WorkerError::Spawn {
                    reason: format!("No handshake from the worker: {err}"),
                })
            }
        }
    }

    fn run_on(&self, slot: &WorkerSlot, request: &BenchmarkRequest) -> f64 {
        let mut connection = slot.connection.lock().unwrap_or_else(PoisonError::into_inner);

        match self.try_run(slot, &mut connection, request) {
            Ok(latency) => {
                self.log(
                    WorkerLogLevel::Full,
                    format!(
                        "{} [{}] on {}: {latency:.5} ms",
                        request.kernel.name,
                        request.config,
                        device_name(slot.device)
                    ),
                );
                latency
            }
            Err(err) => {
                self.log(
                    WorkerLogLevel::Minimal,
                    format!(
                        "Worker failure on {} while benchmarking {} [{}]: {err}",
                        device_name(slot.device),
                        request.kernel.name,
                        request.config
                    ),
                );
                if let Some(mut worker) = connection.take() {
                    worker.kill();
                }
                slot.set_state(WorkerState::Dead);
                f64::INFINITY
            }
        }
    }

    fn try_run(
        &self,
        slot: &WorkerSlot,
        connection: &mut Option<Box<dyn WorkerConnection>>,
        request: &BenchmarkRequest,
    ) -> Result<f64, WorkerError> {
        if connection.is_none() {
            *connection = Some(self.spawn(slot)?);
        }
        let Some(worker) = connection.as_mut() else {
            return Err(WorkerError::Exited {
                status: "no worker".to_string(),
            });
        };

        slot.set_state(WorkerState::InFlight);
        worker.send(&WorkerMessage::Benchmark {
            request: request.clone(),
        })?;

        match worker.recv_timeout(self.options.timeout)? {
            WorkerReply::Timing { latency_ms, device } => {
                // Without isolation the worker isn't bound to any device, so there is nothing to echo.
                if let Some(expected) = self.slot_key(request.expected_device) {
                    if device != Some(expected) {
                        return Err(WorkerError::DeviceMismatch {
                            expected: Some(expected),
                            actual: device,
                        });
                    }
                }
                slot.set_state(WorkerState::Ready);
                Ok(latency_ms.unwrap_or(f64::INFINITY))
            }
            WorkerReply::Rejected { reason, .. } => Err(WorkerError::Protocol {
                reason: format!("Request rejected: {reason}"),
            }),
            reply => Err(WorkerError::Protocol {
                reason: format!("Expected a timing, got {reply:?}"),
            }),
        }
    }

    fn log<S: core::fmt::Display>(&self, level: WorkerLogLevel, msg: S) {
        match level {
            WorkerLogLevel::Minimal => log::warn!("{msg}"),
            _ => log::debug!("{msg}"),
        }

        let mut logger = self.logger.lock();
        let enabled = match (logger.log_level_worker(), level) {
            (WorkerLogLevel::Disabled, _) => false,
            (WorkerLogLevel::Minimal, WorkerLogLevel::Full) => false,
            _ => true,
        };

        if enabled {
            logger.log_worker(&msg);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn device_name(device: Option<u32>) -> String {
    match device {
        Some(device) => format!("device {device}"),
        None => "every device".to_string(),
    }
}

/// Benchmarks candidates through a [worker pool](WorkerPool).
///
/// Inputs that can't describe themselves can't cross a process boundary, and are benchmarked
/// with the local harness instead.
#[derive(new, Clone)]
pub struct PoolBenchmark {
    pool: Arc<WorkerPool>,
    fallback: TimingHarness,
}

impl<In: TuneInputs, Out> CandidateBenchmark<In, Out> for PoolBenchmark {
    fn bench(&self, kernel: &KernelSpec, candidate: &Candidate<In, Out>, inputs: &In) -> f64 {
        self.bench_all(kernel, core::slice::from_ref(candidate), inputs)[0]
    }

    fn bench_all(
        &self,
        kernel: &KernelSpec,
        candidates: &[Candidate<In, Out>],
        inputs: &In,
    ) -> Vec<f64> {
        let args = inputs.describe();

        if args.is_empty() {
            log::warn!(
                "Inputs of {} can't be sent to a worker, benchmarking in-process.",
                kernel.name
            );
            return candidates
                .iter()
                .map(|candidate| self.fallback.bench(candidate, inputs, &kernel.mutated_args))
                .collect();
        }

        let requests: Vec<BenchmarkRequest> = candidates
            .iter()
            .map(|candidate| {
                BenchmarkRequest::new(
                    kernel,
                    args.clone(),
                    candidate.config.clone(),
                    candidate.device.accelerator_index(),
                )
            })
            .collect();

        self.pool.benchmark(&requests)
    }
}
