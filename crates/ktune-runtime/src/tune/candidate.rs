use super::{Configuration, HeuristicKind};
use crate::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Error raised by the compile collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// The configuration can't be compiled or would exceed resource limits.
    #[error("Infeasible configuration: {reason}")]
    Infeasible {
        /// Why the configuration was rejected.
        reason: String,
    },
    /// The compiler failed.
    #[error("Compilation failed: {reason}")]
    Failed {
        /// The compiler message.
        reason: String,
    },
}

/// Error raised while launching a candidate.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LaunchError {
    /// The kernel failed while executing.
    #[error("Kernel execution failed: {reason}")]
    Execution {
        /// The failure message.
        reason: String,
    },
    /// The inputs don't match what the kernel expects.
    #[error("Invalid kernel inputs: {reason}")]
    InvalidInputs {
        /// What doesn't match.
        reason: String,
    },
}

/// Resource usage reported by the compiler for one candidate.
#[derive(new, Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Registers used per thread.
    pub registers: u32,
    /// Registers spilled to local memory per thread.
    pub spills: u32,
    /// Shared memory used per thread group, in bytes.
    pub shared_memory: u32,
}

/// Properties of the device candidates are compiled for, used for occupancy decisions.
#[derive(new, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties {
    /// Registers available per multiprocessor.
    pub regs_per_multiprocessor: u32,
    /// Maximum number of resident threads per multiprocessor.
    pub max_threads_per_multiprocessor: u32,
    /// Number of multiprocessors.
    pub multiprocessor_count: u32,
    /// Threads per warp.
    pub warp_size: u32,
}

type LaunchFn<In, Out> = dyn Fn(&In) -> Result<Out, LaunchError> + Send + Sync;

/// A callable holding a compiled kernel and its bound launch parameters.
pub struct Launcher<In, Out> {
    func: Arc<LaunchFn<In, Out>>,
}

impl<In, Out> Clone for Launcher<In, Out> {
    fn clone(&self) -> Self {
        Self {
            func: self.func.clone(),
        }
    }
}

impl<In, Out> Launcher<In, Out> {
    /// Create a launcher from a function.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&In) -> Result<Out, LaunchError> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(func),
        }
    }

    /// Launch the kernel on the given inputs.
    pub fn launch(&self, inputs: &In) -> Result<Out, LaunchError> {
        (self.func)(inputs)
    }
}

/// A compiled binding of a kernel to one [configuration](Configuration) on one device.
pub struct Candidate<In, Out> {
    /// The configuration the candidate was compiled from.
    pub config: Configuration,
    /// The device the candidate runs on.
    pub device: DeviceId,
    /// Resource usage reported by the compiler.
    pub usage: ResourceUsage,
    launcher: Launcher<In, Out>,
}

impl<In, Out> Clone for Candidate<In, Out> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            device: self.device,
            usage: self.usage,
            launcher: self.launcher.clone(),
        }
    }
}

impl<In, Out> core::fmt::Debug for Candidate<In, Out> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Candidate")
            .field("config", &self.config)
            .field("device", &self.device)
            .field("usage", &self.usage)
            .finish()
    }
}

impl<In, Out> Candidate<In, Out> {
    /// Create a new candidate.
    pub fn new(
        config: Configuration,
        device: DeviceId,
        usage: ResourceUsage,
        launcher: Launcher<In, Out>,
    ) -> Self {
        Self {
            config,
            device,
            usage,
            launcher,
        }
    }

    /// Launch the candidate on the given inputs.
    pub fn launch(&self, inputs: &In) -> Result<Out, LaunchError> {
        self.launcher.launch(inputs)
    }

    /// The launcher of the candidate.
    pub fn launcher(&self) -> &Launcher<In, Out> {
        &self.launcher
    }

    /// Returns the candidate with its launcher replaced, e.g. by an instrumented one.
    pub fn map_launcher<F>(self, func: F) -> Self
    where
        F: FnOnce(Launcher<In, Out>) -> Launcher<In, Out>,
    {
        Self {
            launcher: func(self.launcher),
            ..self
        }
    }
}

/// Identity of a kernel being tuned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Human readable name, also used to derive the cache file name.
    pub name: String,
    /// Content hash of the kernel source.
    pub source_hash: String,
    /// Kind of heuristic that produced the candidate set.
    pub heuristic: HeuristicKind,
    /// Indices of the arguments the kernel writes in place.
    pub mutated_args: Vec<usize>,
    /// Whether the kernel is user-written, in which case register spills are not filtered.
    pub custom: bool,
    /// Problem sizes, e.g. `xnumel` and `rnumel`.
    pub size_hints: BTreeMap<String, u64>,
    /// Version of the compiler backend, part of the cache key.
    pub backend_version: String,
}

impl KernelSpec {
    /// Create a new kernel identity.
    pub fn new(
        name: impl Into<String>,
        source_hash: impl Into<String>,
        heuristic: HeuristicKind,
    ) -> Self {
        Self {
            name: name.into(),
            source_hash: source_hash.into(),
            heuristic,
            mutated_args: Vec::new(),
            custom: false,
            size_hints: BTreeMap::new(),
            backend_version: String::new(),
        }
    }

    /// Mark arguments as written in place.
    pub fn with_mutated_args(mut self, mutated_args: Vec<usize>) -> Self {
        self.mutated_args = mutated_args;
        self
    }

    /// Mark the kernel as user-written.
    pub fn with_custom(mut self, custom: bool) -> Self {
        self.custom = custom;
        self
    }

    /// Set a problem size hint.
    pub fn with_size_hint(mut self, name: impl Into<String>, value: u64) -> Self {
        self.size_hints.insert(name.into(), value);
        self
    }

    /// Set the backend version.
    pub fn with_backend_version(mut self, version: impl Into<String>) -> Self {
        self.backend_version = version.into();
        self
    }

    /// Whether the argument at `index` is written in place.
    pub fn is_mutated(&self, index: usize) -> bool {
        self.mutated_args.contains(&index)
    }
}

/// The code generator collaborator turning a configuration into a runnable candidate.
///
/// Compiling the same kernel and configuration twice must give equivalent candidates.
pub trait KernelCompiler<In, Out>: Send + Sync {
    /// Compile the kernel with the given configuration.
    fn compile(
        &self,
        kernel: &KernelSpec,
        config: &Configuration,
    ) -> Result<Candidate<In, Out>, CompileError>;

    /// Properties of the device candidates are compiled for, when known.
    fn device_properties(&self) -> Option<DeviceProperties> {
        None
    }
}

impl<In, Out, F> KernelCompiler<In, Out> for F
where
    F: Fn(&KernelSpec, &Configuration) -> Result<Candidate<In, Out>, CompileError> + Send + Sync,
{
    fn compile(
        &self,
        kernel: &KernelSpec,
        config: &Configuration,
    ) -> Result<Candidate<In, Out>, CompileError> {
        self(kernel, config)
    }
}
