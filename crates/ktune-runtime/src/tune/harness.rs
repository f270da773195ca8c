use super::{Candidate, KernelSpec, LaunchError, TuneInputs};
use crate::benchmark::{BenchmarkComputations, BenchmarkDurations};
use core::time::Duration;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

/// Number of launches used to estimate the runtime of a candidate before sizing the benchmark.
const ESTIMATE_RUNS: u32 = 5;

/// Measures the latency of candidates.
///
/// A candidate that can't be measured is scored `+inf` instead of failing the whole benchmark.
pub trait CandidateBenchmark<In, Out>: Send + Sync {
    /// Latency of one candidate in milliseconds.
    fn bench(&self, kernel: &KernelSpec, candidate: &Candidate<In, Out>, inputs: &In) -> f64;

    /// Latency of every candidate in milliseconds, in the same order.
    fn bench_all(
        &self,
        kernel: &KernelSpec,
        candidates: &[Candidate<In, Out>],
        inputs: &In,
    ) -> Vec<f64> {
        candidates
            .iter()
            .map(|candidate| self.bench(kernel, candidate, inputs))
            .collect()
    }
}

impl<In, Out, F> CandidateBenchmark<In, Out> for F
where
    F: Fn(&KernelSpec, &Candidate<In, Out>, &In) -> f64 + Send + Sync,
{
    fn bench(&self, kernel: &KernelSpec, candidate: &Candidate<In, Out>, inputs: &In) -> f64 {
        self(kernel, candidate, inputs)
    }
}

/// Runs a candidate repeatedly within a time budget and reports the median latency.
#[derive(new, Clone, Copy, Debug, PartialEq)]
pub struct TimingHarness {
    /// Time spent warming up before measuring.
    pub warmup: Duration,
    /// Time spent measuring.
    pub rep: Duration,
    /// Upper bound on the number of warmup and measured runs.
    pub max_runs: usize,
}

impl Default for TimingHarness {
    fn default() -> Self {
        Self {
            warmup: Duration::from_millis(25),
            rep: Duration::from_millis(100),
            max_runs: 1000,
        }
    }
}

impl TimingHarness {
    /// Median latency of the candidate in milliseconds, or `+inf` if it fails or panics.
    ///
    /// Arguments listed in `mutated` are cloned before every launch, outside the timed region.
    pub fn bench<In: TuneInputs, Out>(
        &self,
        candidate: &Candidate<In, Out>,
        inputs: &In,
        mutated: &[usize],
    ) -> f64 {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.measure(candidate, inputs, mutated)
        }));

        match result {
            Ok(Ok(durations)) if !durations.is_empty() => {
                let computed = BenchmarkComputations::new(&durations);
                computed.median.as_secs_f64() * 1000.0
            }
            Ok(Ok(_)) => f64::INFINITY,
            Ok(Err(err)) => {
                log::warn!("Candidate {} failed while benchmarking: {err}", candidate.config);
                f64::INFINITY
            }
            Err(_) => {
                log::warn!(
                    "Caught a panic while benchmarking candidate {}, scoring it as infinitely slow.",
                    candidate.config
                );
                f64::INFINITY
            }
        }
    }

    /// Collect the raw durations of the candidate.
    pub fn measure<In: TuneInputs, Out>(
        &self,
        candidate: &Candidate<In, Out>,
        inputs: &In,
        mutated: &[usize],
    ) -> Result<BenchmarkDurations, LaunchError> {
        let mut estimate = Duration::ZERO;
        for _ in 0..ESTIMATE_RUNS {
            estimate += timed_launch(candidate, inputs, mutated)?;
        }
        let estimate = (estimate / ESTIMATE_RUNS).max(Duration::from_nanos(1));

        let n_warmup = self.runs_within(self.warmup, estimate);
        let n_repeat = self.runs_within(self.rep, estimate);

        for _ in 0..n_warmup {
            timed_launch(candidate, inputs, mutated)?;
        }

        let mut durations = Vec::with_capacity(n_repeat);
        for _ in 0..n_repeat {
            durations.push(timed_launch(candidate, inputs, mutated)?);
        }

        Ok(BenchmarkDurations::from_system(durations))
    }

    fn runs_within(&self, budget: Duration, per_run: Duration) -> usize {
        let runs = (budget.as_secs_f64() / per_run.as_secs_f64()) as usize;
        runs.clamp(1, self.max_runs.max(1))
    }
}

impl<In: TuneInputs, Out> CandidateBenchmark<In, Out> for TimingHarness {
    fn bench(&self, kernel: &KernelSpec, candidate: &Candidate<In, Out>, inputs: &In) -> f64 {
        TimingHarness::bench(self, candidate, inputs, &kernel.mutated_args)
    }
}

fn timed_launch<In: TuneInputs, Out>(
    candidate: &Candidate<In, Out>,
    inputs: &In,
    mutated: &[usize],
) -> Result<Duration, LaunchError> {
    let inputs = if mutated.is_empty() {
        inputs.clone()
    } else {
        inputs.clone_mutated(mutated)
    };

    let start = Instant::now();
    let output = candidate.launch(&inputs)?;
    let elapsed = start.elapsed();
    core::hint::black_box(output);

    Ok(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceId;
    use crate::tune::{Configuration, Launcher, ResourceUsage};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct CountingInputs {
        deep_clones: Arc<AtomicUsize>,
    }

    impl TuneInputs for CountingInputs {
        fn clone_mutated(&self, _mutated: &[usize]) -> Self {
            self.deep_clones.fetch_add(1, Ordering::Relaxed);
            self.clone()
        }
    }

    fn harness() -> TimingHarness {
        TimingHarness::new(Duration::from_millis(1), Duration::from_millis(5), 50)
    }

    fn candidate<F>(func: F) -> Candidate<CountingInputs, ()>
    where
        F: Fn(&CountingInputs) -> Result<(), LaunchError> + Send + Sync + 'static,
    {
        Candidate::new(
            Configuration::new(4, 1),
            DeviceId::host(),
            ResourceUsage::default(),
            Launcher::new(func),
        )
    }

    #[test_log::test]
    fn measures_a_finite_latency() {
        let candidate = candidate(|_| {
            std::thread::sleep(Duration::from_micros(200));
            Ok(())
        });

        let latency = harness().bench(&candidate, &CountingInputs::default(), &[]);

        assert!(latency.is_finite());
        assert!(latency >= 0.2, "{latency}");
    }

    #[test_log::test]
    fn mutated_arguments_are_cloned_before_every_launch() {
        let launches = Arc::new(AtomicUsize::new(0));
        let counter = launches.clone();
        let candidate = candidate(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        let inputs = CountingInputs::default();

        harness().bench(&candidate, &inputs, &[0]);

        assert_eq!(
            inputs.deep_clones.load(Ordering::Relaxed),
            launches.load(Ordering::Relaxed)
        );
    }

    #[test_log::test]
    fn unmutated_arguments_are_shared() {
        let candidate = candidate(|_| Ok(()));
        let inputs = CountingInputs::default();

        harness().bench(&candidate, &inputs, &[]);

        assert_eq!(inputs.deep_clones.load(Ordering::Relaxed), 0);
    }

    #[test_log::test]
    fn failing_candidate_is_infinitely_slow() {
        let candidate = candidate(|_| {
            Err(LaunchError::Execution {
                reason: "out of resources".into(),
            })
        });

        let latency = harness().bench(&candidate, &CountingInputs::default(), &[]);

        assert_eq!(latency, f64::INFINITY);
    }

    #[test_log::test]
    fn panicking_candidate_is_infinitely_slow() {
        let candidate = candidate(|_| panic!("illegal memory access"));

        let latency = harness().bench(&candidate, &CountingInputs::default(), &[]);

        assert_eq!(latency, f64::INFINITY);
    }

    #[test_log::test]
    fn run_counts_are_capped() {
        let launches = Arc::new(AtomicUsize::new(0));
        let counter = launches.clone();
        let candidate = candidate(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        let harness = TimingHarness::new(Duration::from_secs(1), Duration::from_secs(1), 10);

        let durations = harness
            .measure(&candidate, &CountingInputs::default(), &[])
            .unwrap();

        assert_eq!(durations.len(), 10);
        assert_eq!(launches.load(Ordering::Relaxed), ESTIMATE_RUNS as usize + 20);
    }
}
