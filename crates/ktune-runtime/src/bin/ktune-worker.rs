//! Benchmark worker spawned by the worker pool.
//!
//! Requests are read from stdin and replies are written to stdout, one JSON message per line.
//! Logs go to stderr only, stdout belongs to the protocol.

use clap::{Parser, ValueEnum};
use core::time::Duration;
use ktune_runtime::config::worker::WorkerLogLevel;
use ktune_runtime::config::{GlobalConfig, Logger};
use ktune_runtime::kernels::{HostCompiler, HostExecutor, ProbeExecutor};
use ktune_runtime::tune::TimingHarness;
use ktune_runtime::worker::{RequestExecutor, WorkerServer};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about = "Benchmarks kernel candidates on behalf of a ktune worker pool")]
struct WorkerArgs {
    /// Kernels served by this worker.
    #[arg(long, value_enum, default_value_t = WorkerMode::Host)]
    mode: WorkerMode,

    /// Warmup budget per candidate, in milliseconds.
    #[arg(long, default_value_t = 25)]
    warmup_ms: u64,

    /// Measurement budget per candidate, in milliseconds.
    #[arg(long, default_value_t = 100)]
    rep_ms: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum WorkerMode {
    /// The built-in host kernels.
    Host,
    /// Synthetic kernels whose behaviour is chosen by their configuration.
    Probe,
}

fn main() -> ExitCode {
    let args = WorkerArgs::parse();

    let mut config = GlobalConfig::get().as_ref().clone();
    config.worker.logger.stdout = false;
    config.worker.logger.stderr = !matches!(config.worker.logger.level, WorkerLogLevel::Disabled);
    let mut logger = Logger::from_config(Arc::new(config));

    match args.mode {
        WorkerMode::Host => {
            let harness = TimingHarness {
                warmup: Duration::from_millis(args.warmup_ms),
                rep: Duration::from_millis(args.rep_ms),
                ..Default::default()
            };
            serve(HostExecutor::new(HostCompiler::default(), harness), &mut logger)
        }
        WorkerMode::Probe => serve(ProbeExecutor, &mut logger),
    }
}

fn serve<E: RequestExecutor>(executor: E, logger: &mut Logger) -> ExitCode {
    let mut server = WorkerServer::from_env(executor);
    let pid = std::process::id();
    match server.device() {
        Some(device) => logger.log_worker(&format!("Worker {pid} serving device {device}")),
        None => logger.log_worker(&format!("Worker {pid} serving the host")),
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    match server.serve(stdin.lock(), stdout.lock()) {
        Ok(()) => {
            logger.log_worker(&format!("Worker {pid} shut down"));
            ExitCode::SUCCESS
        }
        Err(err) => {
            logger.log_worker(&format!("Worker {pid} stopped: {err}"));
            ExitCode::FAILURE
        }
    }
}
