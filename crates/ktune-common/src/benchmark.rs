use core::fmt::Display;
use core::time::Duration;

/// How a benchmark's durations were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimingMethod {
    /// Wall-clock time measured on the host around a synchronous launch.
    #[default]
    System,
    /// Time reported by the device itself.
    Device,
}

/// Results of a benchmark run.
#[derive(new, Debug, Default, Clone)]
pub struct BenchmarkDurations {
    /// How the durations were measured.
    pub timing_method: TimingMethod,
    /// All durations of the run, in the order they were benchmarked.
    pub durations: Vec<Duration>,
}

impl BenchmarkDurations {
    /// Durations measured with the system clock.
    pub fn from_system(durations: Vec<Duration>) -> Self {
        Self::new(TimingMethod::System, durations)
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.durations.len()
    }

    /// Whether no sample was recorded.
    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    /// Returns the durations sorted in ascending order.
    pub fn sorted(&self) -> Vec<Duration> {
        let mut sorted = self.durations.clone();
        sorted.sort();
        sorted
    }

    /// Mean of the samples left after dropping `fraction` of them at each end.
    ///
    /// A `fraction` of `0.2` drops the fastest and slowest 20%. At least one sample is always kept.
    pub fn trimmed_mean(&self, fraction: f64) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }

        let sorted = self.sorted();
        let trim = ((sorted.len() as f64) * fraction.clamp(0.0, 0.5)).floor() as usize;
        let trim = trim.min((sorted.len() - 1) / 2);
        let kept = &sorted[trim..sorted.len() - trim];
        let total: Duration = kept.iter().sum();

        Some(total / kept.len() as u32)
    }
}

impl Display for BenchmarkDurations {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let computed = BenchmarkComputations::new(self);
        let BenchmarkComputations {
            mean,
            median,
            variance,
            min,
            max,
        } = computed;
        let num_sample = self.durations.len();
        let timing_method = match self.timing_method {
            TimingMethod::System => "system",
            TimingMethod::Device => "device",
        };

        f.write_str(
            format!(
                "
―――――――― Result ―――――――――
  Timing      {timing_method}
  Samples     {num_sample}
  Mean        {mean:.3?}
  Variance    {variance:.3?}
  Median      {median:.3?}
  Min         {min:.3?}
  Max         {max:.3?}
―――――――――――――――――――――――――"
            )
            .as_str(),
        )
    }
}

/// Computed values from benchmark durations.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BenchmarkComputations {
    /// Mean of all the durations.
    pub mean: Duration,
    /// Median of all the durations.
    pub median: Duration,
    /// Variance of all the durations.
    pub variance: Duration,
    /// Minimum duration amongst all durations.
    pub min: Duration,
    /// Maximum duration amongst all durations.
    pub max: Duration,
}

impl BenchmarkComputations {
    /// Compute duration values and return a BenchmarkComputations struct
    pub fn new(durations: &BenchmarkDurations) -> Self {
        if durations.is_empty() {
            return Self::default();
        }

        let sorted = durations.sorted();
        let count = sorted.len();
        let mean = sorted.iter().sum::<Duration>() / count as u32;
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2
        } else {
            sorted[count / 2]
        };
        let variance_secs = sorted
            .iter()
            .map(|duration| {
                let diff = duration.as_secs_f64() - mean.as_secs_f64();
                diff * diff
            })
            .sum::<f64>()
            / count as f64;

        Self {
            mean,
            median,
            variance: Duration::from_secs_f64(variance_secs),
            min: sorted[0],
            max: sorted[count - 1],
        }
    }
}
