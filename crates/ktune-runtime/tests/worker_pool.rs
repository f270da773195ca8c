use core::time::Duration;
use ktune_runtime::kernels::{HostArgs, HostCompiler, HostTensor, TILED_ADD};
use ktune_runtime::tune::{
    AutotuneOptions, CachingAutotuner, Configuration, HeuristicKind, KernelSpec, TuneInputs,
};
use ktune_runtime::worker::{BenchmarkRequest, PoolOptions, ProcessSpawner, WorkerPool, WorkerState};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const WORKER: &str = env!("CARGO_BIN_EXE_ktune-worker");

fn spawner(mode: &str) -> ProcessSpawner {
    ProcessSpawner::new(WORKER)
        .with_args(["--mode", mode, "--warmup-ms", "1", "--rep-ms", "5"])
        .with_visibility_var("KTUNE_TEST_VISIBLE_DEVICES")
}

fn probe_pool(timeout: Duration) -> WorkerPool {
    let options = PoolOptions {
        device_isolation: true,
        timeout,
        spawn_timeout: Duration::from_secs(30),
    };
    WorkerPool::new(spawner("probe"), options)
}

fn probe(config: Configuration, device: Option<u32>) -> BenchmarkRequest {
    let kernel = KernelSpec::new("probe", "probe-source", HeuristicKind::UserAutotune);
    BenchmarkRequest::new(&kernel, Vec::new(), config, device)
}

fn latency(us: u32) -> Configuration {
    Configuration::new(1, 1).param("latency_us", us)
}

#[test_log::test]
fn worker_reports_latencies() {
    let pool = probe_pool(Duration::from_secs(30));

    let latencies = pool.benchmark(&[probe(latency(1500), None), probe(latency(250), None)]);

    assert_eq!(latencies, vec![1.5, 0.25]);
    assert_eq!(pool.worker_states(), vec![(None, WorkerState::Ready)]);
}

#[test_log::test]
fn crashed_worker_is_replaced() {
    let pool = probe_pool(Duration::from_secs(30));
    let crash = Configuration::new(1, 1).param("crash", 1);

    let latencies = pool.benchmark(&[
        probe(latency(1000), None),
        probe(crash, None),
        probe(latency(2000), None),
    ]);

    assert_eq!(latencies, vec![1.0, f64::INFINITY, 2.0]);
}

#[test_log::test]
fn hung_worker_only_costs_its_request() {
    let pool = probe_pool(Duration::from_secs(2));
    let hang = Configuration::new(1, 1).param("hang", 1);

    let latencies = pool.benchmark(&[probe(hang, None), probe(latency(500), None)]);

    assert_eq!(latencies, vec![f64::INFINITY, 0.5]);
}

#[test_log::test]
fn requests_are_routed_to_their_device() {
    let pool = probe_pool(Duration::from_secs(30));
    pool.initialize(&[Some(0), Some(1)]).unwrap();

    let latencies = pool.benchmark(&[
        probe(latency(1000), Some(1)),
        probe(latency(2000), Some(0)),
        probe(latency(3000), Some(1)),
    ]);

    assert_eq!(latencies, vec![1.0, 2.0, 3.0]);
    let mut states = pool.worker_states();
    states.sort_by_key(|(device, _)| *device);
    assert_eq!(
        states,
        vec![(Some(0), WorkerState::Ready), (Some(1), WorkerState::Ready)]
    );
}

#[test_log::test]
fn infeasible_candidates_are_infinitely_slow() {
    let pool = probe_pool(Duration::from_secs(30));
    let infeasible = Configuration::new(1, 1).param("infeasible", 1);

    assert_eq!(pool.benchmark(&[probe(infeasible, None)]), vec![f64::INFINITY]);
    assert_eq!(pool.worker_states(), vec![(None, WorkerState::Ready)]);
}

#[test_log::test]
fn terminated_pool_can_be_reused() {
    let pool = probe_pool(Duration::from_secs(30));
    pool.benchmark(&[probe(latency(1000), None)]);

    pool.terminate();
    pool.terminate();
    assert!(pool.worker_states().is_empty());

    assert_eq!(pool.benchmark(&[probe(latency(1000), None)]), vec![1.0]);
}

#[test_log::test]
fn autotune_through_host_workers() {
    let pool = WorkerPool::new(spawner("host"), PoolOptions::default());
    let mut options = AutotuneOptions::default();
    options.harness.warmup = Duration::from_millis(1);
    options.harness.rep = Duration::from_millis(2);

    let tuner = CachingAutotuner::new(
        HostCompiler::kernel(TILED_ADD).unwrap(),
        HostCompiler::default_configs(TILED_ADD),
        HostCompiler::default(),
    )
    .unwrap()
    .with_options(options)
    .with_pool(Arc::new(pool));

    let len = 4096;
    let out = HostTensor::zeros(vec![len]);
    let args = HostArgs(vec![
        HostTensor::new(vec![len], vec![1.0; len]),
        HostTensor::new(vec![len], vec![2.0; len]),
        out.clone(),
    ]);
    assert_eq!(args.describe().len(), 3);

    tuner.run(&args).unwrap();

    assert!(tuner.timings().iter().all(|timing| timing.latency_ms.is_finite()));
    assert_eq!(out.to_vec(), vec![3.0; len]);
}
