use super::{Axis, Configuration, SearchSpace};
use hashbrown::HashMap;
use std::sync::Arc;

/// Relative improvement below which a new timing is considered noise.
pub const IMPROVEMENT_THRESHOLD: f64 = 0.001;

/// Upper bound on the number of configurations probed by one all-directions sweep.
const MAX_SWEEP_SIZE: usize = 4096;

type Feasibility = Arc<dyn Fn(&Configuration) -> bool + Send + Sync>;

/// Local search refining a configuration one axis at a time.
///
/// Starting from a configuration, every neighbor reachable by moving a single axis up to `radius`
/// steps is benchmarked, and the search moves to the best neighbor improving on the current
/// configuration. It stops at a local optimum, which isn't necessarily the global one.
pub struct CoordinateDescentTuner {
    space: SearchSpace,
    radius: u32,
    check_all_directions: bool,
    threshold: f64,
    feasible: Option<Feasibility>,
    memo: HashMap<Configuration, f64>,
}

/// Result of a [coordinate descent](CoordinateDescentTuner::autotune).
#[derive(Debug, Clone, PartialEq)]
pub struct DescentOutcome {
    /// The best configuration found.
    pub best: Configuration,
    /// Its latency in milliseconds.
    pub timing: f64,
    /// Number of configurations benchmarked by this search.
    pub benchmarked: usize,
}

impl CoordinateDescentTuner {
    /// Create a tuner exploring the given search space with a radius of one step.
    pub fn new(space: SearchSpace) -> Self {
        Self {
            space,
            radius: 1,
            check_all_directions: false,
            threshold: IMPROVEMENT_THRESHOLD,
            feasible: None,
            memo: HashMap::new(),
        }
    }

    /// Probe neighbors up to `radius` steps away on each axis.
    pub fn with_radius(mut self, radius: u32) -> Self {
        self.radius = radius.max(1);
        self
    }

    /// When single-axis moves are exhausted, try every combination of moves across axes.
    pub fn with_check_all_directions(mut self, enabled: bool) -> Self {
        self.check_all_directions = enabled;
        self
    }

    /// Relative improvement a neighbor must achieve to be accepted.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.max(0.0);
        self
    }

    /// Hard resource constraint. Configurations failing it are skipped without benchmarking.
    pub fn with_feasibility<F>(mut self, feasible: F) -> Self
    where
        F: Fn(&Configuration) -> bool + Send + Sync + 'static,
    {
        self.feasible = Some(Arc::new(feasible));
        self
    }

    /// The search space explored.
    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// Remember a timing measured elsewhere, so the configuration isn't benchmarked again.
    pub fn cache_benchmark_result(&mut self, config: Configuration, timing: f64) {
        self.memo.insert(config, timing);
    }

    /// The remembered timing of a configuration.
    pub fn lookup(&self, config: &Configuration) -> Option<f64> {
        self.memo.get(config).copied()
    }

    /// Every configuration with a known timing.
    pub fn visited(&self) -> impl Iterator<Item = (&Configuration, f64)> {
        self.memo.iter().map(|(config, timing)| (config, *timing))
    }

    /// Whether `test` improves on `baseline` by more than the noise threshold.
    pub fn has_improvement(&self, baseline: f64, test: f64) -> bool {
        test.is_finite() && test < baseline * (1.0 - self.threshold)
    }

    /// Refine `start` with `benchmark`, seeding the memo table with `known_results`.
    ///
    /// If the start configuration can't be measured, it is returned unchanged.
    pub fn autotune<F>(
        &mut self,
        mut benchmark: F,
        start: Configuration,
        known_results: impl IntoIterator<Item = (Configuration, f64)>,
    ) -> DescentOutcome
    where
        F: FnMut(&Configuration) -> f64,
    {
        for (config, timing) in known_results {
            self.memo.entry(config).or_insert(timing);
        }

        let mut benchmarked = 0;
        let baseline = self.timing_of(&start, &mut benchmark, &mut benchmarked);

        if !baseline.is_finite() {
            log::warn!("Coordinate descent skipped, the start configuration {start} failed.");
            return DescentOutcome {
                best: start,
                timing: baseline,
                benchmarked,
            };
        }

        let mut best = start;
        let mut best_timing = baseline;

        loop {
            let mut step = self.best_improvement(
                self.single_axis_neighbours(&best),
                best_timing,
                &mut benchmark,
                &mut benchmarked,
            );

            if step.is_none() && self.check_all_directions {
                step = self.best_improvement(
                    self.all_directions_neighbours(&best),
                    best_timing,
                    &mut benchmark,
                    &mut benchmarked,
                );
            }

            match step {
                Some((config, timing)) => {
                    log::debug!(
                        "Coordinate descent moved to {config} ({best_timing:.4} ms -> {timing:.4} ms)"
                    );
                    best = config;
                    best_timing = timing;
                }
                None => break,
            }
        }

        DescentOutcome {
            best,
            timing: best_timing,
            benchmarked,
        }
    }

    fn timing_of<F>(
        &mut self,
        config: &Configuration,
        benchmark: &mut F,
        benchmarked: &mut usize,
    ) -> f64
    where
        F: FnMut(&Configuration) -> f64,
    {
        if let Some(timing) = self.memo.get(config) {
            return *timing;
        }

        let timing = benchmark(config);
        *benchmarked += 1;
        self.memo.insert(config.clone(), timing);
        timing
    }

    fn best_improvement<F>(
        &mut self,
        neighbours: Vec<Configuration>,
        baseline: f64,
        benchmark: &mut F,
        benchmarked: &mut usize,
    ) -> Option<(Configuration, f64)>
    where
        F: FnMut(&Configuration) -> f64,
    {
        let mut best: Option<(Configuration, f64)> = None;

        for config in neighbours {
            let timing = self.timing_of(&config, benchmark, benchmarked);
            let reference = best.as_ref().map(|(_, t)| *t).unwrap_or(baseline);

            if self.has_improvement(baseline, timing) && timing < reference {
                best = Some((config, timing));
            }
        }

        best
    }

    fn admissible(&self, config: &Configuration) -> bool {
        self.space.within_bounds(config)
            && self.feasible.as_ref().is_none_or(|feasible| feasible(config))
    }

    fn searched_axes(&self, config: &Configuration) -> Vec<Axis> {
        config
            .axes()
            .into_iter()
            .filter(|axis| !self.space.is_frozen(axis))
            .collect()
    }

    fn axis_values(&self, config: &Configuration, axis: &Axis) -> Vec<u32> {
        match config.axis(axis) {
            Some(value) => self
                .space
                .step(axis)
                .neighbours(value, self.radius)
                .into_iter()
                .filter(|value| *value <= self.space.bound(axis))
                .collect(),
            None => Vec::new(),
        }
    }

    fn single_axis_neighbours(&self, config: &Configuration) -> Vec<Configuration> {
        let mut neighbours = Vec::new();

        for axis in self.searched_axes(config) {
            for value in self.axis_values(config, &axis) {
                let neighbour = config.with(&axis, value);
                if self.admissible(&neighbour) {
                    neighbours.push(neighbour);
                }
            }
        }

        neighbours
    }

    fn all_directions_neighbours(&self, config: &Configuration) -> Vec<Configuration> {
        let axes = self.searched_axes(config);
        let options: Vec<(Axis, Vec<u32>)> = axes
            .into_iter()
            .filter_map(|axis| {
                let current = config.axis(&axis)?;
                let mut values = vec![current];
                values.extend(self.axis_values(config, &axis));
                Some((axis, values))
            })
            .collect();

        let size = options
            .iter()
            .try_fold(1usize, |acc, (_, values)| acc.checked_mul(values.len()));

        match size {
            Some(size) if size <= MAX_SWEEP_SIZE => {}
            _ => {
                log::debug!("Skipping the all-directions sweep around {config}, too many combinations.");
                return Vec::new();
            }
        }

        let mut combinations = vec![config.clone()];
        for (axis, values) in options.iter() {
            combinations = combinations
                .into_iter()
                .flat_map(|base| values.iter().map(move |value| base.with(axis, *value)))
                .collect();
        }

        combinations
            .into_iter()
            .filter(|candidate| candidate != config && self.admissible(candidate))
            .collect()
    }
}
