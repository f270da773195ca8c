use super::{
    AutotuneError, AutotuneOptions, BandwidthReport, Candidate, CandidateBenchmark, CompileError,
    Configuration, CoordinateDescentTuner, HeuristicKind, KernelCompiler, KernelSpec,
    PersistentCache, ProfiledLauncher, REDUCTION_BLOCK, SearchSpace, TuneInputs, X_BLOCK, X_NUMEL,
    content_hash, needs_smaller_reduction_block, unique_configs,
};
use crate::config::autotune::AutotuneLogLevel;
use crate::config::{GlobalConfig, Logger};
use crate::worker::{PoolBenchmark, WorkerPool};
use hashbrown::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Feasibility = Arc<dyn Fn(&Configuration) -> bool + Send + Sync>;

/// Latency measured for one configuration.
#[derive(new, Debug, Clone, PartialEq)]
pub struct Timing {
    /// The configuration benchmarked.
    pub config: Configuration,
    /// Its latency in milliseconds, `+inf` when it failed.
    pub latency_ms: f64,
}

/// Autotunes a kernel among a set of configurations and runs the winner.
///
/// Candidates are compiled lazily on first use, benchmarked, and all but the fastest are dropped.
/// The winner can be refined with coordinate descent and is persisted, so the next autotuner
/// created for the same kernel and candidate set skips the search.
pub struct CachingAutotuner<In, Out> {
    kernel: KernelSpec,
    configs: Vec<Configuration>,
    compiler: Arc<dyn KernelCompiler<In, Out>>,
    benchmark: Option<Arc<dyn CandidateBenchmark<In, Out>>>,
    pool: Option<Arc<WorkerPool>>,
    options: AutotuneOptions,
    space: SearchSpace,
    feasible: Option<Feasibility>,
    cache: PersistentCache,
    logger: Arc<spin::Mutex<Logger>>,
    state: Mutex<TunerState<In, Out>>,
    winner: spin::RwLock<Option<Candidate<In, Out>>>,
    profiler: spin::RwLock<Option<ProfiledLauncher>>,
}

struct TunerState<In, Out> {
    // `None` until precompiled.
    candidates: Option<Vec<Candidate<In, Out>>>,
    content_hash: Option<String>,
    timings: Vec<Timing>,
}

impl<In, Out> Default for TunerState<In, Out> {
    fn default() -> Self {
        Self {
            candidates: None,
            content_hash: None,
            timings: Vec::new(),
        }
    }
}

impl<In: TuneInputs, Out: 'static> CachingAutotuner<In, Out> {
    /// Create an autotuner for `kernel` over `configs`.
    ///
    /// Duplicated configurations are dropped, the first occurrence is kept.
    pub fn new<C>(
        kernel: KernelSpec,
        configs: Vec<Configuration>,
        compiler: C,
    ) -> Result<Self, AutotuneError>
    where
        C: KernelCompiler<In, Out> + 'static,
    {
        if configs.is_empty() {
            return Err(AutotuneError::EmptyConfigurationSet);
        }

        Ok(Self {
            kernel,
            configs: unique_configs(configs),
            compiler: Arc::new(compiler),
            benchmark: None,
            pool: None,
            options: AutotuneOptions::default(),
            space: SearchSpace::default(),
            feasible: None,
            cache: PersistentCache::disabled(),
            logger: Arc::new(spin::Mutex::new(Logger::disabled())),
            state: Mutex::new(TunerState::default()),
            winner: spin::RwLock::new(None),
            profiler: spin::RwLock::new(None),
        })
    }

    /// Use the options, persistent cache and loggers of the given configuration.
    pub fn with_config(self, config: Arc<GlobalConfig>) -> Self {
        self.with_options(AutotuneOptions::from_config(&config.autotune))
            .with_cache(PersistentCache::from_config(&config.autotune))
            .with_logger(Arc::new(spin::Mutex::new(Logger::from_config(config))))
    }

    /// Set the options.
    pub fn with_options(mut self, options: AutotuneOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the persistent cache.
    pub fn with_cache(mut self, cache: PersistentCache) -> Self {
        self.cache = cache;
        self
    }

    /// Set the logger.
    pub fn with_logger(mut self, logger: Arc<spin::Mutex<Logger>>) -> Self {
        self.logger = logger;
        self
    }

    /// Set the search space explored by coordinate descent.
    pub fn with_search_space(mut self, space: SearchSpace) -> Self {
        self.space = space;
        self
    }

    /// Hard resource constraint checked before coordinate descent benchmarks a configuration.
    pub fn with_feasibility<F>(mut self, feasible: F) -> Self
    where
        F: Fn(&Configuration) -> bool + Send + Sync + 'static,
    {
        self.feasible = Some(Arc::new(feasible));
        self
    }

    /// Benchmark candidates in isolated worker processes.
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Benchmark candidates with a custom strategy.
    pub fn with_benchmark<B>(mut self, benchmark: B) -> Self
    where
        B: CandidateBenchmark<In, Out> + 'static,
    {
        self.benchmark = Some(Arc::new(benchmark));
        self
    }

    /// The kernel being tuned.
    pub fn kernel(&self) -> &KernelSpec {
        &self.kernel
    }

    /// The offered configurations, without duplicates.
    pub fn configs(&self) -> &[Configuration] {
        &self.configs
    }

    /// The winning configuration, once selected.
    pub fn winner(&self) -> Option<Configuration> {
        self.winner.read().as_ref().map(|winner| winner.config.clone())
    }

    /// Timings measured while selecting the winner.
    pub fn timings(&self) -> Vec<Timing> {
        self.lock_state().timings.clone()
    }

    /// Statistics of the winner's launches, when bandwidth profiling is enabled for this kernel.
    pub fn profile(&self) -> Option<ProfiledLauncher> {
        self.profiler.read().as_ref().cloned()
    }

    /// Compile every configuration into a candidate.
    ///
    /// Infeasible configurations are skipped. A hit in the persistent cache compiles only the
    /// stored winner.
    pub fn precompile(&self) -> Result<(), AutotuneError> {
        let mut state = self.lock_state();
        self.precompile_locked(&mut state)
    }

    /// Benchmark every surviving candidate against the same inputs.
    pub fn benchmark_all(&self, inputs: &In) -> Result<Vec<Timing>, AutotuneError> {
        let mut state = self.lock_state();
        self.precompile_locked(&mut state)?;

        let candidates = state.candidates.as_deref().unwrap_or_default();
        let latencies = self.benchmark_candidates(candidates, inputs);

        Ok(candidates
            .iter()
            .zip(latencies)
            .map(|(candidate, latency)| Timing::new(candidate.config.clone(), latency))
            .collect())
    }

    /// Select the winner, benchmarking the candidates if it isn't known yet.
    pub fn select_best(&self, inputs: &In) -> Result<Configuration, AutotuneError> {
        Ok(self.ensure_winner(inputs)?.config)
    }

    /// Run the winner, autotuning first if needed.
    ///
    /// Once the winner is known, calls only take a read lock before launching it.
    pub fn run(&self, inputs: &In) -> Result<Out, AutotuneError> {
        let winner = self.winner.read().as_ref().cloned();
        let winner = match winner {
            Some(winner) => winner,
            None => self.ensure_winner(inputs)?,
        };

        Ok(winner.launch(inputs)?)
    }

    fn lock_state(&self) -> MutexGuard<'_, TunerState<In, Out>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn benchmarker(&self) -> Arc<dyn CandidateBenchmark<In, Out>> {
        if let Some(benchmark) = self.benchmark.as_ref() {
            return benchmark.clone();
        }

        match self.pool.as_ref() {
            Some(pool) => Arc::new(PoolBenchmark::new(pool.clone(), self.options.harness)),
            None => Arc::new(self.options.harness),
        }
    }

    fn local_search_enabled(&self) -> bool {
        self.options.local_search_enabled(self.kernel.heuristic)
    }

    fn effective_configs(&self) -> Vec<Configuration> {
        let mut limit = self.options.max_configs;

        if self.options.deterministic && self.kernel.heuristic == HeuristicKind::Pointwise {
            limit = Some(1);
        }

        match limit {
            Some(limit) => self.configs.iter().take(limit.max(1)).cloned().collect(),
            None => self.configs.clone(),
        }
    }

    // A single configuration without refinement has nothing to remember.
    fn uses_cache(&self, num_configs: usize) -> bool {
        self.cache.is_enabled() && (num_configs > 1 || self.local_search_enabled())
    }

    fn precompile_locked(&self, state: &mut TunerState<In, Out>) -> Result<(), AutotuneError> {
        if state.candidates.is_some() {
            return Ok(());
        }

        let configs = self.effective_configs();
        let hash = content_hash(&self.kernel, &configs, &self.space);

        if self.uses_cache(configs.len()) {
            if let Some(candidate) = self.load_cached(&hash, &configs) {
                self.set_winner(candidate.clone());
                state.candidates = Some(vec![candidate]);
                state.content_hash = Some(hash);
                return Ok(());
            }
        }

        let mut seen: HashSet<Configuration> = configs.iter().cloned().collect();
        let mut candidates = self.compile_all(&configs);

        if self.kernel.heuristic == HeuristicKind::Reduction {
            self.rescale_reductions(&mut candidates, &mut seen);
        }

        if candidates.is_empty() {
            return Err(AutotuneError::AllCandidatesInfeasible {
                kernel: self.kernel.name.clone(),
            });
        }

        log::debug!(
            "Precompiled {} of {} configurations of {}",
            candidates.len(),
            configs.len(),
            self.kernel.name
        );

        state.candidates = Some(candidates);
        state.content_hash = Some(hash);
        Ok(())
    }

    fn load_cached(&self, hash: &str, configs: &[Configuration]) -> Option<Candidate<In, Out>> {
        let entry = self.cache.lookup(&self.kernel, hash)?;

        let config = if entry.found_by_local_search && self.local_search_enabled() {
            entry.config
        } else {
            let mut matching = configs.iter().filter(|config| **config == entry.config);
            match (matching.next(), matching.next()) {
                (Some(config), None) => config.clone(),
                _ => return None,
            }
        };

        match self.compiler.compile(&self.kernel, &config) {
            Ok(candidate) => {
                self.log_autotune(
                    AutotuneLogLevel::Minimal,
                    format!("Cache hit for {}: {config}", self.kernel.name),
                );
                Some(candidate)
            }
            Err(err) => {
                log::warn!(
                    "Cached configuration {config} of {} no longer compiles: {err}",
                    self.kernel.name
                );
                None
            }
        }
    }

    fn compile_all(&self, configs: &[Configuration]) -> Vec<Candidate<In, Out>> {
        let threads = match self.options.compile_threads {
            0 => std::thread::available_parallelism()
                .map(|threads| threads.get())
                .unwrap_or(1),
            threads => threads,
        }
        .min(configs.len())
        .max(1);

        let results: Vec<Result<Candidate<In, Out>, CompileError>> = if threads == 1 {
            configs
                .iter()
                .map(|config| self.compiler.compile(&self.kernel, config))
                .collect()
        } else {
            let compiler = self.compiler.as_ref();
            let kernel = &self.kernel;
            let chunk_size = configs.len().div_ceil(threads);

            std::thread::scope(|scope| {
                let handles: Vec<_> = configs
                    .chunks(chunk_size)
                    .map(|chunk| {
                        let handle = scope.spawn(move || {
                            chunk
                                .iter()
                                .map(|config| compiler.compile(kernel, config))
                                .collect::<Vec<_>>()
                        });
                        (chunk.len(), handle)
                    })
                    .collect();

                handles
                    .into_iter()
                    .flat_map(|(len, handle)| {
                        handle.join().unwrap_or_else(|_| {
                            (0..len)
                                .map(|_| {
                                    Err(CompileError::Failed {
                                        reason: "The compiler panicked".to_string(),
                                    })
                                })
                                .collect()
                        })
                    })
                    .collect()
            })
        };

        configs
            .iter()
            .zip(results)
            .filter_map(|(config, result)| match result {
                Ok(candidate) => Some(candidate),
                Err(err) => {
                    log::info!("Skipping configuration {config} of {}: {err}", self.kernel.name);
                    None
                }
            })
            .collect()
    }

    fn rescale_reductions(
        &self,
        candidates: &mut Vec<Candidate<In, Out>>,
        seen: &mut HashSet<Configuration>,
    ) {
        let (Some(device), Some(xnumel)) = (
            self.compiler.device_properties(),
            self.kernel.size_hints.get(X_NUMEL).copied(),
        ) else {
            return;
        };

        let mut extra = Vec::new();
        for candidate in candidates.iter() {
            let config = &candidate.config;
            let Some(reduction_block) = config.get(REDUCTION_BLOCK) else {
                continue;
            };

            if !needs_smaller_reduction_block(
                reduction_block,
                config.get(X_BLOCK).unwrap_or(1),
                candidate.usage.registers,
                config.parallelism_width(),
                xnumel,
                &device,
            ) {
                continue;
            }

            let rescaled = config.clone().param(REDUCTION_BLOCK, reduction_block / 2);
            if !seen.insert(rescaled.clone()) {
                continue;
            }

            match self.compiler.compile(&self.kernel, &rescaled) {
                Ok(candidate) => {
                    log::debug!("Added rescaled reduction configuration {rescaled}");
                    extra.push(candidate);
                }
                Err(err) => log::info!("Skipping rescaled configuration {rescaled}: {err}"),
            }
        }

        candidates.extend(extra);
    }

    fn spills_too_much(&self, candidate: &Candidate<In, Out>) -> bool {
        !self.kernel.custom && candidate.usage.spills > self.options.spill_threshold
    }

    fn benchmark_candidates(&self, candidates: &[Candidate<In, Out>], inputs: &In) -> Vec<f64> {
        let (runnable, filtered): (Vec<usize>, Vec<usize>) =
            (0..candidates.len()).partition(|index| !self.spills_too_much(&candidates[*index]));

        for index in filtered.iter() {
            let candidate = &candidates[*index];
            log::debug!(
                "Skipping {} without benchmarking, {} spilled registers",
                candidate.config,
                candidate.usage.spills
            );
        }

        let to_run: Vec<Candidate<In, Out>> = runnable
            .iter()
            .map(|index| candidates[*index].clone())
            .collect();
        let measured = self.benchmarker().bench_all(&self.kernel, &to_run, inputs);

        let mut latencies = vec![f64::INFINITY; candidates.len()];
        for (index, latency) in runnable.into_iter().zip(measured) {
            latencies[index] = latency;
        }

        for (candidate, latency) in candidates.iter().zip(latencies.iter()) {
            self.log_autotune(
                AutotuneLogLevel::Full,
                format!(
                    "{} {}: {latency:.5} ms, {} registers, {} spills, {} shared memory",
                    self.kernel.name,
                    candidate.config,
                    candidate.usage.registers,
                    candidate.usage.spills,
                    candidate.usage.shared_memory
                ),
            );
        }

        latencies
    }

    fn benchmark_one(&self, candidate: &Candidate<In, Out>, inputs: &In) -> f64 {
        self.benchmark_candidates(core::slice::from_ref(candidate), inputs)[0]
    }

    fn ensure_winner(&self, inputs: &In) -> Result<Candidate<In, Out>, AutotuneError> {
        let mut state = self.lock_state();
        self.precompile_locked(&mut state)?;

        if let Some(winner) = self.winner.read().as_ref().cloned() {
            return Ok(winner);
        }

        let candidates = state.candidates.take().unwrap_or_default();
        let timings: Vec<Timing> = match candidates.len() {
            1 => Vec::new(),
            _ => candidates
                .iter()
                .zip(self.benchmark_candidates(&candidates, inputs))
                .map(|(candidate, latency)| Timing::new(candidate.config.clone(), latency))
                .collect(),
        };

        let best_index = timings
            .iter()
            .enumerate()
            .filter(|(_, timing)| timing.latency_ms.is_finite())
            .min_by(|(_, a), (_, b)| a.latency_ms.total_cmp(&b.latency_ms))
            .map(|(index, _)| index);

        let best_index = match (best_index, candidates.len()) {
            (Some(index), _) => index,
            (None, 1) => 0,
            (None, _) => {
                state.candidates = Some(candidates);
                state.timings = timings;
                return Err(AutotuneError::NoViableConfiguration {
                    kernel: self.kernel.name.clone(),
                });
            }
        };

        let mut winner = candidates[best_index].clone();
        drop(candidates);

        if let Some(timing) = timings.get(best_index) {
            self.log_autotune(
                AutotuneLogLevel::Minimal,
                format!(
                    "Autotuned {}: {} ({:.5} ms)",
                    self.kernel.name, timing.config, timing.latency_ms
                ),
            );
        }

        let found_by_local_search = self.local_search_enabled();
        if found_by_local_search {
            winner = self.refine(winner, &timings, inputs);
        }

        if let Some(hash) = state.content_hash.as_ref() {
            if self.uses_cache(self.effective_configs().len()) {
                self.cache
                    .store(&self.kernel, hash, &winner.config, found_by_local_search);
            }
        }

        let winner = self.profile_winner(winner, inputs);
        self.set_winner(winner.clone());
        state.candidates = Some(vec![winner.clone()]);
        state.timings = timings;

        Ok(winner)
    }

    fn refine(
        &self,
        start: Candidate<In, Out>,
        timings: &[Timing],
        inputs: &In,
    ) -> Candidate<In, Out> {
        let mut tuner = CoordinateDescentTuner::new(self.space.clone())
            .with_radius(self.options.coordinate_descent_radius)
            .with_check_all_directions(self.options.check_all_directions);

        if let Some(feasible) = self.feasible.clone() {
            tuner = tuner.with_feasibility(move |config| feasible(config));
        }

        let known = timings
            .iter()
            .map(|timing| (timing.config.clone(), timing.latency_ms));
        let mut compiled: HashMap<Configuration, Candidate<In, Out>> = HashMap::new();
        compiled.insert(start.config.clone(), start.clone());

        let outcome = tuner.autotune(
            |config: &Configuration| {
                if let Some(candidate) = compiled.get(config) {
                    return self.benchmark_one(candidate, inputs);
                }

                match self.compiler.compile(&self.kernel, config) {
                    Ok(candidate) => {
                        let latency = self.benchmark_one(&candidate, inputs);
                        compiled.insert(config.clone(), candidate);
                        latency
                    }
                    Err(err) => {
                        log::debug!("Coordinate descent skipped {config}: {err}");
                        f64::INFINITY
                    }
                }
            },
            start.config.clone(),
            known,
        );

        if outcome.best == start.config {
            return start;
        }

        match compiled.remove(&outcome.best) {
            Some(candidate) => {
                self.log_autotune(
                    AutotuneLogLevel::Minimal,
                    format!(
                        "Coordinate descent improved {}: {} -> {} ({:.5} ms)",
                        self.kernel.name, start.config, outcome.best, outcome.timing
                    ),
                );
                candidate
            }
            None => start,
        }
    }

    fn profile_winner(&self, winner: Candidate<In, Out>, inputs: &In) -> Candidate<In, Out> {
        let Some(regex) = self.options.profile_bandwidth.as_ref() else {
            return winner;
        };
        if !regex.is_match(&self.kernel.name) {
            return winner;
        }

        let report = BandwidthReport::new(
            self.kernel.name.clone(),
            winner.config.clone(),
            self.benchmark_one(&winner, inputs),
            inputs.num_bytes(),
        );
        log::info!("{report}");
        self.log_autotune(AutotuneLogLevel::Minimal, report);

        let profiler = ProfiledLauncher::new(self.kernel.name.clone());
        let winner = winner.map_launcher(|launcher| profiler.wrap(launcher));
        *self.profiler.write() = Some(profiler);

        winner
    }

    fn set_winner(&self, winner: Candidate<In, Out>) {
        *self.winner.write() = Some(winner);
    }

    fn log_autotune<S: core::fmt::Display>(&self, level: AutotuneLogLevel, msg: S) {
        let mut logger = self.logger.lock();
        let enabled = match (logger.log_level_autotune(), level) {
            (AutotuneLogLevel::Disabled, _) => false,
            (AutotuneLogLevel::Minimal, AutotuneLogLevel::Full) => false,
            _ => true,
        };

        if enabled {
            logger.log_autotune(&msg);
        }
    }
}
