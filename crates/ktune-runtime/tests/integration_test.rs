mod dummy;

use dummy::*;
use ktune_runtime::kernels::{HostArgs, HostCompiler, HostTensor, TILED_ADD, TILED_MATMUL};
use ktune_runtime::tune::{
    AutotuneError, AutotuneOptions, Axis, CachingAutotuner, Candidate, Configuration,
    HeuristicKind, KernelSpec, PersistentCache, SearchSpace, StepRule, content_hash,
};
use pretty_assertions::assert_eq;

fn descent_options() -> AutotuneOptions {
    AutotuneOptions {
        coordinate_descent: true,
        ..Default::default()
    }
}

fn descent_space() -> SearchSpace {
    SearchSpace::default()
        .with_step(Axis::Param(BLOCK.into()), StepRule::Offset { delta: 16 })
        .freeze(Axis::ParallelismWidth)
        .freeze(Axis::PipelineDepth)
}

#[test_log::test]
fn autotune_selects_the_fastest_configuration() {
    let compiler = CountingCompiler::new();
    let tuner = CachingAutotuner::new(
        dummy_kernel("select_fastest", HeuristicKind::Pointwise),
        block_configs(&[16, 32, 64]),
        compiler.clone(),
    )
    .unwrap()
    .with_benchmark(latency_table(&[(16, 5.0), (32, 2.0), (64, 9.0)]));

    let output = tuner.run(&()).unwrap();

    assert_eq!(output, block_config(32));
    assert_eq!(tuner.winner(), Some(block_config(32)));
    let latencies: Vec<f64> = tuner.timings().iter().map(|t| t.latency_ms).collect();
    assert_eq!(latencies, vec![5.0, 2.0, 9.0]);
}

#[test_log::test]
fn every_offered_configuration_is_considered() {
    let blocks: Vec<u32> = (1..=10).map(|step| step * 16).collect();
    let tuner = CachingAutotuner::new(
        dummy_kernel("many_configs", HeuristicKind::Pointwise),
        block_configs(&blocks),
        CountingCompiler::new(),
    )
    .unwrap()
    .with_benchmark(|_: &KernelSpec, candidate: &Candidate<(), Configuration>, _: &()| {
        match candidate.config.get(BLOCK) {
            Some(160) => 1.0,
            _ => 5.0,
        }
    });

    assert_eq!(tuner.run(&()).unwrap(), block_config(160));
    assert_eq!(tuner.timings().len(), 10);
}

#[test_log::test]
fn autotune_compiles_each_configuration_once() {
    let compiler = CountingCompiler::new();
    let tuner = CachingAutotuner::new(
        dummy_kernel("compile_once", HeuristicKind::Pointwise),
        block_configs(&[16, 32, 64]),
        compiler.clone(),
    )
    .unwrap()
    .with_benchmark(latency_table(&[(16, 5.0), (32, 2.0), (64, 9.0)]));

    tuner.precompile().unwrap();
    tuner.run(&()).unwrap();
    tuner.run(&()).unwrap();
    tuner.select_best(&()).unwrap();

    assert_eq!(compiler.total_compiles(), 3);
    for config in block_configs(&[16, 32, 64]) {
        assert_eq!(compiler.compile_count(&config), 1);
    }
}

#[test_log::test]
fn duplicated_configurations_are_compiled_once() {
    let compiler = CountingCompiler::new();
    let tuner = CachingAutotuner::new(
        dummy_kernel("duplicates", HeuristicKind::Pointwise),
        block_configs(&[16, 32, 16]),
        compiler.clone(),
    )
    .unwrap()
    .with_benchmark(latency_table(&[(16, 1.0), (32, 2.0)]));

    assert_eq!(tuner.configs().len(), 2);
    assert_eq!(tuner.run(&()).unwrap(), block_config(16));
    assert_eq!(compiler.total_compiles(), 2);
}

#[test_log::test]
fn single_configuration_is_not_benchmarked() {
    let tuner = CachingAutotuner::new(
        dummy_kernel("single", HeuristicKind::Template),
        block_configs(&[64]),
        CountingCompiler::new(),
    )
    .unwrap()
    .with_benchmark(|_: &KernelSpec, _: &Candidate<(), Configuration>, _: &()| -> f64 {
        panic!("A single candidate must not be benchmarked")
    });

    assert_eq!(tuner.run(&()).unwrap(), block_config(64));
    assert!(tuner.timings().is_empty());
}

#[test_log::test]
fn empty_configuration_set_is_an_error() {
    let result = CachingAutotuner::new(
        dummy_kernel("empty", HeuristicKind::Pointwise),
        Vec::new(),
        CountingCompiler::new(),
    );

    assert!(matches!(result, Err(AutotuneError::EmptyConfigurationSet)));
}

#[test_log::test]
fn infeasible_configurations_are_skipped() {
    let compiler = CountingCompiler::new().with_max_block(32);
    let tuner = CachingAutotuner::new(
        dummy_kernel("skip_infeasible", HeuristicKind::Pointwise),
        block_configs(&[16, 32, 64]),
        compiler,
    )
    .unwrap()
    .with_benchmark(latency_table(&[(16, 5.0), (32, 2.0), (64, 1.0)]));

    assert_eq!(tuner.select_best(&()).unwrap(), block_config(32));
    assert_eq!(tuner.timings().len(), 2);
}

#[test_log::test]
fn all_infeasible_configurations_is_an_error() {
    let tuner = CachingAutotuner::new(
        dummy_kernel("all_infeasible", HeuristicKind::Pointwise),
        block_configs(&[64, 128]),
        CountingCompiler::new().with_max_block(32),
    )
    .unwrap()
    .with_benchmark(latency_table(&[]));

    assert!(matches!(
        tuner.run(&()),
        Err(AutotuneError::AllCandidatesInfeasible { .. })
    ));
}

#[test_log::test]
fn every_candidate_failing_is_an_error() {
    let tuner = CachingAutotuner::new(
        dummy_kernel("no_viable", HeuristicKind::Pointwise),
        block_configs(&[16, 32]),
        CountingCompiler::new(),
    )
    .unwrap()
    .with_benchmark(latency_table(&[]));

    assert!(matches!(
        tuner.run(&()),
        Err(AutotuneError::NoViableConfiguration { .. })
    ));
    assert_eq!(tuner.winner(), None);
}

#[test_log::test]
fn spilling_candidates_are_not_benchmarked() {
    let compiler = CountingCompiler::new().with_spills(16, 100);
    let tuner = CachingAutotuner::new(
        dummy_kernel("spills", HeuristicKind::Pointwise),
        block_configs(&[16, 32]),
        compiler,
    )
    .unwrap()
    .with_benchmark(latency_table(&[(16, 1.0), (32, 2.0)]));

    assert_eq!(tuner.select_best(&()).unwrap(), block_config(32));
    assert_eq!(tuner.timings()[0].latency_ms, f64::INFINITY);
}

#[test_log::test]
fn custom_kernels_are_benchmarked_even_when_spilling() {
    let compiler = CountingCompiler::new().with_spills(16, 100);
    let tuner = CachingAutotuner::new(
        dummy_kernel("custom_spills", HeuristicKind::UserAutotune).with_custom(true),
        block_configs(&[16, 32]),
        compiler,
    )
    .unwrap()
    .with_benchmark(latency_table(&[(16, 1.0), (32, 2.0)]));

    assert_eq!(tuner.select_best(&()).unwrap(), block_config(16));
}

#[test_log::test]
fn coordinate_descent_refines_the_winner() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = dummy_kernel("descent", HeuristicKind::Pointwise);
    let configs = block_configs(&[16, 32, 64]);
    let tuner = CachingAutotuner::new(kernel.clone(), configs.clone(), CountingCompiler::new())
        .unwrap()
        .with_options(descent_options())
        .with_search_space(descent_space())
        .with_cache(PersistentCache::local(dir.path()))
        .with_benchmark(valley_at_48());

    assert_eq!(tuner.run(&()).unwrap(), block_config(48));

    let hash = content_hash(&kernel, &configs, &descent_space());
    let entry = PersistentCache::local(dir.path())
        .lookup(&kernel, &hash)
        .unwrap();
    assert_eq!(entry.config, block_config(48));
    assert!(entry.found_by_local_search);
}

#[test_log::test]
fn coordinate_descent_is_skipped_for_templates() {
    let tuner = CachingAutotuner::new(
        dummy_kernel("template_descent", HeuristicKind::Template),
        block_configs(&[16, 32, 64]),
        CountingCompiler::new(),
    )
    .unwrap()
    .with_options(descent_options())
    .with_search_space(descent_space())
    .with_benchmark(valley_at_48());

    assert_eq!(tuner.run(&()).unwrap(), block_config(32));
}

#[test_log::test]
fn cached_winner_skips_the_search() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = dummy_kernel("cache_hit", HeuristicKind::Pointwise);
    let configs = block_configs(&[16, 32, 64]);

    let first = CachingAutotuner::new(kernel.clone(), configs.clone(), CountingCompiler::new())
        .unwrap()
        .with_cache(PersistentCache::local(dir.path()))
        .with_benchmark(latency_table(&[(16, 5.0), (32, 2.0), (64, 9.0)]));
    first.run(&()).unwrap();

    let compiler = CountingCompiler::new();
    let second = CachingAutotuner::new(kernel, configs, compiler.clone())
        .unwrap()
        .with_cache(PersistentCache::local(dir.path()))
        .with_benchmark(|_: &KernelSpec, _: &Candidate<(), Configuration>, _: &()| -> f64 {
            panic!("A cached winner must not be benchmarked")
        });

    assert_eq!(second.run(&()).unwrap(), block_config(32));
    assert_eq!(compiler.total_compiles(), 1);
}

#[test_log::test]
fn cached_winner_that_no_longer_compiles_is_searched_again() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = dummy_kernel("cache_uncompilable", HeuristicKind::Pointwise);
    let configs = block_configs(&[16, 32, 64]);

    CachingAutotuner::new(kernel.clone(), configs.clone(), CountingCompiler::new())
        .unwrap()
        .with_cache(PersistentCache::local(dir.path()))
        .with_benchmark(latency_table(&[(16, 5.0), (32, 2.0), (64, 1.0)]))
        .run(&())
        .unwrap();

    let tuner = CachingAutotuner::new(kernel, configs, CountingCompiler::new().with_max_block(32))
        .unwrap()
        .with_cache(PersistentCache::local(dir.path()))
        .with_benchmark(latency_table(&[(16, 5.0), (32, 2.0), (64, 1.0)]));

    assert_eq!(tuner.run(&()).unwrap(), block_config(32));
    assert_eq!(tuner.timings().len(), 2);
}

#[test_log::test]
fn cached_descent_winner_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = dummy_kernel("cache_descent", HeuristicKind::Pointwise);
    let configs = block_configs(&[16, 32, 64]);
    let build = |compiler: CountingCompiler| {
        CachingAutotuner::new(kernel.clone(), configs.clone(), compiler)
            .unwrap()
            .with_options(descent_options())
            .with_search_space(descent_space())
            .with_cache(PersistentCache::local(dir.path()))
            .with_benchmark(valley_at_48())
    };

    build(CountingCompiler::new()).run(&()).unwrap();

    let compiler = CountingCompiler::new();
    let second = build(compiler.clone());
    assert_eq!(second.run(&()).unwrap(), block_config(48));
    assert_eq!(compiler.total_compiles(), 1);
    assert_eq!(compiler.compile_count(&block_config(48)), 1);
}

#[test_log::test]
fn changing_the_candidate_set_invalidates_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let kernel = dummy_kernel("cache_miss", HeuristicKind::Pointwise);

    CachingAutotuner::new(kernel.clone(), block_configs(&[16, 32]), CountingCompiler::new())
        .unwrap()
        .with_cache(PersistentCache::local(dir.path()))
        .with_benchmark(latency_table(&[(16, 5.0), (32, 2.0), (64, 1.0)]))
        .run(&())
        .unwrap();

    let compiler = CountingCompiler::new();
    let tuner = CachingAutotuner::new(kernel, block_configs(&[16, 32, 64]), compiler.clone())
        .unwrap()
        .with_cache(PersistentCache::local(dir.path()))
        .with_benchmark(latency_table(&[(16, 5.0), (32, 2.0), (64, 1.0)]));

    assert_eq!(tuner.run(&()).unwrap(), block_config(64));
    assert_eq!(compiler.total_compiles(), 3);
}

#[test_log::test]
fn concurrent_runs_select_a_single_winner() {
    let compiler = CountingCompiler::new();
    let tuner = CachingAutotuner::new(
        dummy_kernel("concurrent", HeuristicKind::Pointwise),
        block_configs(&[16, 32, 64]),
        compiler.clone(),
    )
    .unwrap()
    .with_benchmark(latency_table(&[(16, 5.0), (32, 2.0), (64, 9.0)]));

    let outputs: Vec<Configuration> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| tuner.run(&()).unwrap()))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert!(outputs.iter().all(|output| *output == block_config(32)));
    assert_eq!(compiler.total_compiles(), 3);
}

#[test_log::test]
fn host_add_matches_the_reference() {
    let kernel = HostCompiler::kernel(TILED_ADD).unwrap();
    let configs = HostCompiler::default_configs(TILED_ADD);
    let mut options = AutotuneOptions::default();
    options.harness.warmup = core::time::Duration::from_millis(1);
    options.harness.rep = core::time::Duration::from_millis(2);

    let tuner = CachingAutotuner::new(kernel, configs, HostCompiler::default())
        .unwrap()
        .with_options(options);

    let len = 10_000;
    let a = HostTensor::new(vec![len], (0..len).map(|i| i as f32).collect());
    let b = HostTensor::new(vec![len], vec![2.0; len]);
    let out = HostTensor::zeros(vec![len]);
    let args = HostArgs(vec![a, b, out.clone()]);

    tuner.run(&args).unwrap();

    let expected: Vec<f32> = (0..len).map(|i| i as f32 + 2.0).collect();
    assert_eq!(out.to_vec(), expected);
}

#[test_log::test]
fn host_matmul_matches_the_reference() {
    let kernel = HostCompiler::kernel(TILED_MATMUL).unwrap();
    let configs = HostCompiler::default_configs(TILED_MATMUL);
    let mut options = AutotuneOptions::default();
    options.harness.warmup = core::time::Duration::from_millis(1);
    options.harness.rep = core::time::Duration::from_millis(2);

    let tuner = CachingAutotuner::new(kernel, configs, HostCompiler::default())
        .unwrap()
        .with_options(options);

    let (m, k, n) = (33, 17, 9);
    let lhs: Vec<f32> = (0..m * k).map(|i| (i % 3) as f32).collect();
    let rhs: Vec<f32> = (0..k * n).map(|i| (i % 4) as f32 - 1.0).collect();
    let out = HostTensor::zeros(vec![m, n]);
    let args = HostArgs(vec![
        HostTensor::new(vec![m, k], lhs.clone()),
        HostTensor::new(vec![k, n], rhs.clone()),
        out.clone(),
    ]);

    tuner.run(&args).unwrap();

    let mut expected = vec![0.0f32; m * n];
    for row in 0..m {
        for col in 0..n {
            expected[row * n + col] = (0..k).map(|p| lhs[row * k + p] * rhs[p * n + col]).sum();
        }
    }
    assert_eq!(out.to_vec(), expected);
}
