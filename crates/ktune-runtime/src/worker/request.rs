use crate::tune::{ArgSpec, Configuration, KernelSpec};
use serde::{Deserialize, Serialize};

/// Identity of a kernel, enough for a worker to compile it again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelRef {
    /// The kernel name.
    pub name: String,
    /// Content hash of the kernel source.
    pub source_hash: String,
}

/// A self-contained benchmark job that can cross a process boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRequest {
    /// The kernel to benchmark.
    pub kernel: KernelRef,
    /// Metadata of every argument, used to materialize representative inputs.
    pub args: Vec<ArgSpec>,
    /// The configuration to compile.
    pub config: Configuration,
    /// The device the worker executing the request must be bound to.
    pub expected_device: Option<u32>,
}

impl BenchmarkRequest {
    /// Create a request for `kernel` compiled with `config`.
    ///
    /// Arguments the kernel writes in place are flagged as mutated.
    pub fn new(
        kernel: &KernelSpec,
        args: Vec<ArgSpec>,
        config: Configuration,
        expected_device: Option<u32>,
    ) -> Self {
        let args = args
            .into_iter()
            .enumerate()
            .map(|(index, mut arg)| {
                arg.mutated |= kernel.is_mutated(index);
                arg
            })
            .collect();

        Self {
            kernel: KernelRef {
                name: kernel.name.clone(),
                source_hash: kernel.source_hash.clone(),
            },
            args,
            config,
            expected_device,
        }
    }

    /// Indices of the arguments written in place.
    pub fn mutated_args(&self) -> Vec<usize> {
        self.args
            .iter()
            .enumerate()
            .filter_map(|(index, arg)| arg.mutated.then_some(index))
            .collect()
    }
}
