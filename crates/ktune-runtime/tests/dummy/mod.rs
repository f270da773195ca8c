mod compiler;

pub use compiler::*;

use ktune_runtime::tune::{Candidate, Configuration, HeuristicKind, KernelSpec};

/// Parameter tuned by the dummy kernels.
pub const BLOCK: &str = "BLOCK";

pub fn dummy_kernel(name: &str, heuristic: HeuristicKind) -> KernelSpec {
    KernelSpec::new(name, format!("{name}-source-v1"), heuristic).with_backend_version("dummy-1")
}

pub fn block_config(block: u32) -> Configuration {
    Configuration::new(4, 2).param(BLOCK, block)
}

pub fn block_configs(blocks: &[u32]) -> Vec<Configuration> {
    blocks.iter().map(|block| block_config(*block)).collect()
}

/// Benchmark reporting a fixed latency per block size, `+inf` for unknown sizes.
pub fn latency_table(
    table: &'static [(u32, f64)],
) -> impl Fn(&KernelSpec, &Candidate<(), Configuration>, &()) -> f64 + Send + Sync + 'static {
    move |_kernel, candidate, _inputs| {
        let block = candidate.config.get(BLOCK);
        table
            .iter()
            .find(|(size, _)| Some(*size) == block)
            .map(|(_, latency)| *latency)
            .unwrap_or(f64::INFINITY)
    }
}

/// Benchmark whose latency grows by 0.5 ms every 16 elements away from a block of 48.
pub fn valley_at_48() -> impl Fn(&KernelSpec, &Candidate<(), Configuration>, &()) -> f64 + Send + Sync + 'static
{
    |_kernel, candidate, _inputs| match candidate.config.get(BLOCK) {
        Some(block) => 1.5 + block.abs_diff(48) as f64 / 16.0 * 0.5,
        None => f64::INFINITY,
    }
}
