use super::{Configuration, Launcher, TuneInputs};
use core::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Achieved memory bandwidth of a kernel.
#[derive(new, Debug, Clone, PartialEq)]
pub struct BandwidthReport {
    /// The kernel name.
    pub kernel: String,
    /// The configuration measured.
    pub config: Configuration,
    /// Latency in milliseconds.
    pub latency_ms: f64,
    /// Bytes read and written by one launch.
    pub num_bytes: usize,
}

impl BandwidthReport {
    /// Gigabytes moved by one launch.
    pub fn gigabytes(&self) -> f64 {
        self.num_bytes as f64 / 1e9
    }

    /// Achieved bandwidth in gigabytes per second.
    pub fn gigabytes_per_second(&self) -> f64 {
        match self.latency_ms > 0.0 {
            true => self.gigabytes() / (self.latency_ms / 1e3),
            false => 0.0,
        }
    }
}

impl Display for BandwidthReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:.3}ms    {:.3}GB    {:7.2}GB/s    {} [{}]",
            self.latency_ms,
            self.gigabytes(),
            self.gigabytes_per_second(),
            self.kernel,
            self.config
        )
    }
}

/// Launch statistics collected by a [profiled launcher](ProfiledLauncher).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchStats {
    /// Number of launches.
    pub launches: usize,
    /// Total time spent in launches.
    pub total: Duration,
    /// Total bytes touched by the launches.
    pub num_bytes: usize,
}

impl LaunchStats {
    /// Average bandwidth over every launch, in gigabytes per second.
    pub fn gigabytes_per_second(&self) -> f64 {
        let secs = self.total.as_secs_f64();
        match secs > 0.0 {
            true => self.num_bytes as f64 / 1e9 / secs,
            false => 0.0,
        }
    }
}

/// Decorates a launcher to record the time and bytes of every launch.
#[derive(Clone)]
pub struct ProfiledLauncher {
    kernel: String,
    stats: Arc<spin::Mutex<LaunchStats>>,
}

impl ProfiledLauncher {
    /// Create a profiler for the given kernel.
    pub fn new(kernel: impl Into<String>) -> Self {
        Self {
            kernel: kernel.into(),
            stats: Default::default(),
        }
    }

    /// Wrap a launcher, keeping its results unchanged.
    pub fn wrap<In, Out>(&self, launcher: Launcher<In, Out>) -> Launcher<In, Out>
    where
        In: TuneInputs,
        Out: 'static,
    {
        let stats = self.stats.clone();
        let kernel = self.kernel.clone();

        Launcher::new(move |inputs: &In| {
            let start = Instant::now();
            let output = launcher.launch(inputs);
            let elapsed = start.elapsed();

            let mut stats = stats.lock();
            stats.launches += 1;
            stats.total += elapsed;
            stats.num_bytes += inputs.num_bytes();
            if stats.launches == 1 {
                log::info!(
                    "{kernel}: first launch took {:.3}ms",
                    elapsed.as_secs_f64() * 1e3
                );
            }

            output
        })
    }

    /// Statistics collected so far.
    pub fn stats(&self) -> LaunchStats {
        self.stats.lock().clone()
    }
}

impl core::fmt::Debug for ProfiledLauncher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProfiledLauncher")
            .field("kernel", &self.kernel)
            .field("stats", &self.stats())
            .finish()
    }
}
