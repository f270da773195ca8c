use crate::worker::{BenchmarkRequest, RequestExecutor};
use core::time::Duration;

/// Executes synthetic requests, reporting latencies chosen by the configuration.
///
/// Recognized parameters:
/// - `latency_us`: the reported latency, in microseconds.
/// - `infeasible`: the candidate fails and is reported as infinitely slow.
/// - `crash`: the worker process aborts.
/// - `hang`: the worker never answers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProbeExecutor;

impl RequestExecutor for ProbeExecutor {
    fn execute(&mut self, request: &BenchmarkRequest) -> Result<f64, String> {
        let config = &request.config;

        if config.get("crash").is_some_and(|crash| crash > 0) {
            log::error!("Probe crash requested by {config}");
            std::process::abort();
        }

        if config.get("hang").is_some_and(|hang| hang > 0) {
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }

        if config.get("infeasible").is_some_and(|infeasible| infeasible > 0) {
            return Ok(f64::INFINITY);
        }

        match config.get("latency_us") {
            Some(latency) => Ok(latency as f64 / 1000.0),
            None => Err(format!("Probe request without latency: {config}")),
        }
    }
}
