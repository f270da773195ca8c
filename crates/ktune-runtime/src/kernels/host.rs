use crate::DeviceId;
use crate::tune::{
    ArgSpec, Candidate, CompileError, Configuration, DType, HeuristicKind, KernelCompiler,
    KernelSpec, LaunchError, Launcher, ResourceUsage, TimingHarness, TuneInputs,
};
use crate::worker::{BenchmarkRequest, RequestExecutor};
use ktune_common::hash::ContentHasher;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Elementwise addition `out = a + b` over tiles of `BLOCK` elements.
pub const TILED_ADD: &str = "host.tiled_add";

/// Matrix multiplication `out = a @ b` over `BLOCK_M x BLOCK_N` output tiles, accumulating
/// `BLOCK_K` columns of `a` at a time.
pub const TILED_MATMUL: &str = "host.tiled_matmul";

const TILED_ADD_SOURCE: &str = "tiled_add(a: [n], b: [n], out: [n]) tile=BLOCK v1";
const TILED_MATMUL_SOURCE: &str =
    "tiled_matmul(a: [m, k], b: [k, n], out: [m, n]) tile=BLOCK_M,BLOCK_N,BLOCK_K v1";

const MAX_REGISTERS: u32 = 255;
const THREADS_PER_GROUP: u32 = 32;

/// A host tensor of `f32` values. Clones share the same buffer.
#[derive(Clone, Debug)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Arc<spin::RwLock<Vec<f32>>>,
}

impl HostTensor {
    /// Create a tensor from its values.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            shape,
            data: Arc::new(spin::RwLock::new(data)),
        }
    }

    /// A tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self::new(shape, vec![0.0; len])
    }

    /// A tensor with values uniformly drawn in `[-1, 1)`.
    pub fn random<R: Rng>(shape: Vec<usize>, rng: &mut R) -> Self {
        let len = shape.iter().product();
        let data = (0..len).map(|_| rng.random_range(-1.0f32..1.0)).collect();
        Self::new(shape, data)
    }

    /// The shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// A copy of the values.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.read().clone()
    }

    /// A copy not sharing the buffer.
    pub fn deep_clone(&self) -> Self {
        Self::new(self.shape.clone(), self.to_vec())
    }

    /// Whether both tensors share the same buffer.
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Arguments of a host kernel.
#[derive(Clone, Debug)]
pub struct HostArgs(pub Vec<HostTensor>);

impl HostArgs {
    /// Random tensors matching the given argument descriptions.
    pub fn random<R: Rng>(args: &[ArgSpec], rng: &mut R) -> Result<Self, LaunchError> {
        args.iter()
            .map(|arg| match arg.dtype {
                DType::F32 => Ok(HostTensor::random(arg.shape.clone(), rng)),
                dtype => Err(LaunchError::InvalidInputs {
                    reason: format!("Host kernels only support f32, got {dtype:?}"),
                }),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(HostArgs)
    }
}

impl TuneInputs for HostArgs {
    fn clone_mutated(&self, mutated: &[usize]) -> Self {
        HostArgs(
            self.0
                .iter()
                .enumerate()
                .map(|(index, tensor)| match mutated.contains(&index) {
                    true => tensor.deep_clone(),
                    false => tensor.clone(),
                })
                .collect(),
        )
    }

    fn describe(&self) -> Vec<ArgSpec> {
        self.0
            .iter()
            .map(|tensor| ArgSpec::new(tensor.shape.clone(), DType::F32, DeviceId::host(), false))
            .collect()
    }
}

/// Resource limits of the host "device".
#[derive(new, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLimits {
    /// Largest working set of one tile, in bytes.
    pub max_tile_bytes: u32,
    /// Largest parallelism width.
    pub max_threads: u32,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            max_tile_bytes: 48 * 1024,
            max_threads: 64,
        }
    }
}

/// Compiles the built-in host kernels.
///
/// The parallelism width is the number of threads a launch is split across. Configurations
/// whose tiles don't fit [the limits](HostLimits) are infeasible.
#[derive(new, Debug, Clone, Copy, Default)]
pub struct HostCompiler {
    limits: HostLimits,
}

impl HostCompiler {
    /// The identity of a built-in kernel.
    pub fn kernel(name: &str) -> Option<KernelSpec> {
        let (source, mutated) = match name {
            TILED_ADD => (TILED_ADD_SOURCE, 2),
            TILED_MATMUL => (TILED_MATMUL_SOURCE, 2),
            _ => return None,
        };

        Some(
            KernelSpec::new(name, ContentHasher::hash_str(source), HeuristicKind::Template)
                .with_mutated_args(vec![mutated])
                .with_backend_version(concat!("host-", env!("CARGO_PKG_VERSION"))),
        )
    }

    /// The configurations usually offered for a built-in kernel.
    pub fn default_configs(name: &str) -> Vec<Configuration> {
        match name {
            TILED_ADD => [256, 1024, 4096]
                .into_iter()
                .flat_map(|block| {
                    [1, 4].map(|width| Configuration::new(width, 1).param("BLOCK", block))
                })
                .collect(),
            TILED_MATMUL => [(16, 16, 16), (32, 32, 16), (64, 64, 32)]
                .into_iter()
                .flat_map(|(m, n, k)| {
                    [1, 4].map(|width| {
                        Configuration::new(width, 2)
                            .param("BLOCK_M", m)
                            .param("BLOCK_N", n)
                            .param("BLOCK_K", k)
                    })
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn param(config: &Configuration, name: &str) -> Result<usize, CompileError> {
        match config.get(name) {
            Some(0) | None => Err(CompileError::Infeasible {
                reason: format!("{name} must be set and positive"),
            }),
            Some(value) => Ok(value as usize),
        }
    }

    fn usage(&self, config: &Configuration, tile_elements: usize) -> Result<ResourceUsage, CompileError> {
        let threads = config.parallelism_width();
        if threads == 0 || threads > self.limits.max_threads {
            return Err(CompileError::Infeasible {
                reason: format!("Parallelism width {threads} outside 1..={}", self.limits.max_threads),
            });
        }

        let tile_bytes = tile_elements.saturating_mul(4);
        if tile_bytes > self.limits.max_tile_bytes as usize {
            return Err(CompileError::Infeasible {
                reason: format!(
                    "Tile of {tile_bytes} bytes exceeds {} bytes",
                    self.limits.max_tile_bytes
                ),
            });
        }

        let per_thread = (tile_elements / (threads * THREADS_PER_GROUP) as usize) as u32 + 16;

        Ok(ResourceUsage::new(
            per_thread.min(MAX_REGISTERS),
            per_thread.saturating_sub(MAX_REGISTERS),
            tile_bytes as u32,
        ))
    }
}

impl KernelCompiler<HostArgs, ()> for HostCompiler {
    fn compile(
        &self,
        kernel: &KernelSpec,
        config: &Configuration,
    ) -> Result<Candidate<HostArgs, ()>, CompileError> {
        let builtin = Self::kernel(&kernel.name).ok_or_else(|| CompileError::Failed {
            reason: format!("Unknown host kernel {}", kernel.name),
        })?;
        if builtin.source_hash != kernel.source_hash {
            return Err(CompileError::Failed {
                reason: format!("Source of {} doesn't match the built-in kernel", kernel.name),
            });
        }

        let threads = config.parallelism_width() as usize;

        let (usage, launcher) = match kernel.name.as_str() {
            TILED_ADD => {
                let block = Self::param(config, "BLOCK")?;
                let usage = self.usage(config, block * 3)?;
                let launcher = Launcher::new(move |args: &HostArgs| tiled_add(args, block, threads));
                (usage, launcher)
            }
            _ => {
                let tile = Tile {
                    m: Self::param(config, "BLOCK_M")?,
                    n: Self::param(config, "BLOCK_N")?,
                    k: Self::param(config, "BLOCK_K")?,
                };
                let usage = self.usage(config, tile.m * tile.k + tile.k * tile.n + tile.m * tile.n)?;
                let launcher = Launcher::new(move |args: &HostArgs| tiled_matmul(args, tile, threads));
                (usage, launcher)
            }
        };

        Ok(Candidate::new(config.clone(), DeviceId::host(), usage, launcher))
    }
}

fn check_output(out: &HostTensor, inputs: &[&HostTensor]) -> Result<(), LaunchError> {
    if inputs.iter().any(|input| out.same_buffer(input)) {
        return Err(LaunchError::InvalidInputs {
            reason: "The output aliases an input".to_string(),
        });
    }
    Ok(())
}

fn tiled_add(args: &HostArgs, block: usize, threads: usize) -> Result<(), LaunchError> {
    let [a, b, out] = args.0.as_slice() else {
        return Err(LaunchError::InvalidInputs {
            reason: format!("{TILED_ADD} takes 3 arguments, got {}", args.0.len()),
        });
    };
    check_output(out, &[a, b])?;

    let (a, b) = (a.data.read(), b.data.read());
    let mut out = out.data.write();
    if a.len() != out.len() || b.len() != out.len() {
        return Err(LaunchError::InvalidInputs {
            reason: "Arguments must have the same number of elements".to_string(),
        });
    }

    let (a, b): (&[f32], &[f32]) = (&a, &b);
    let tiles = out.len().div_ceil(block);
    let part_len = (tiles.div_ceil(threads.max(1)) * block).max(1);

    std::thread::scope(|scope| {
        for (part, values) in out.chunks_mut(part_len).enumerate() {
            scope.spawn(move || {
                let offset = part * part_len;
                for (tile, values) in values.chunks_mut(block).enumerate() {
                    let base = offset + tile * block;
                    for (i, value) in values.iter_mut().enumerate() {
                        *value = a[base + i] + b[base + i];
                    }
                }
            });
        }
    });

    Ok(())
}

#[derive(Clone, Copy, Debug)]
struct Tile {
    m: usize,
    n: usize,
    k: usize,
}

fn tiled_matmul(args: &HostArgs, tile: Tile, threads: usize) -> Result<(), LaunchError> {
    let [lhs, rhs, out] = args.0.as_slice() else {
        return Err(LaunchError::InvalidInputs {
            reason: format!("{TILED_MATMUL} takes 3 arguments, got {}", args.0.len()),
        });
    };
    check_output(out, &[lhs, rhs])?;

    let (m, k, n) = match (lhs.shape(), rhs.shape(), out.shape()) {
        ([m, k], [k2, n], [m2, n2]) if k == k2 && m == m2 && n == n2 => (*m, *k, *n),
        (lhs, rhs, out) => {
            return Err(LaunchError::InvalidInputs {
                reason: format!("Can't multiply {lhs:?} by {rhs:?} into {out:?}"),
            });
        }
    };

    let (lhs, rhs) = (lhs.data.read(), rhs.data.read());
    let mut out = out.data.write();
    let (lhs, rhs): (&[f32], &[f32]) = (&lhs, &rhs);
    if m == 0 || n == 0 {
        return Ok(());
    }

    let row_tiles = m.div_ceil(tile.m);
    let rows_per_part = row_tiles.div_ceil(threads.max(1)) * tile.m;

    std::thread::scope(|scope| {
        for (part, values) in out.chunks_mut(rows_per_part * n).enumerate() {
            scope.spawn(move || {
                values.fill(0.0);
                let row_offset = part * rows_per_part;
                let rows = values.len() / n;

                for row_start in (0..rows).step_by(tile.m) {
                    let row_end = (row_start + tile.m).min(rows);
                    for col_start in (0..n).step_by(tile.n) {
                        let col_end = (col_start + tile.n).min(n);
                        for k_start in (0..k).step_by(tile.k) {
                            let k_end = (k_start + tile.k).min(k);
                            for row in row_start..row_end {
                                let global_row = row_offset + row;
                                for col in col_start..col_end {
                                    let mut acc = 0.0;
                                    for p in k_start..k_end {
                                        acc += lhs[global_row * k + p] * rhs[p * n + col];
                                    }
                                    values[row * n + col] += acc;
                                }
                            }
                        }
                    }
                }
            });
        }
    });

    Ok(())
}

/// Benchmarks the built-in host kernels inside a worker process.
pub struct HostExecutor {
    compiler: HostCompiler,
    harness: TimingHarness,
    rng: StdRng,
}

impl HostExecutor {
    /// Create an executor.
    pub fn new(compiler: HostCompiler, harness: TimingHarness) -> Self {
        Self {
            compiler,
            harness,
            rng: StdRng::seed_from_u64(0),
        }
    }
}

impl RequestExecutor for HostExecutor {
    fn execute(&mut self, request: &BenchmarkRequest) -> Result<f64, String> {
        let kernel = HostCompiler::kernel(&request.kernel.name)
            .ok_or_else(|| format!("Unknown host kernel {}", request.kernel.name))?;
        if kernel.source_hash != request.kernel.source_hash {
            return Err(format!(
                "Source of {} doesn't match the built-in kernel",
                request.kernel.name
            ));
        }
        let kernel = kernel.with_mutated_args(request.mutated_args());

        let candidate = match self.compiler.compile(&kernel, &request.config) {
            Ok(candidate) => candidate,
            Err(err) => {
                log::info!("{err}");
                return Ok(f64::INFINITY);
            }
        };
        let inputs = HostArgs::random(&request.args, &mut self.rng).map_err(|err| err.to_string())?;

        Ok(self.harness.bench(&candidate, &inputs, &kernel.mutated_args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::KernelRef;
    use core::time::Duration;
    use pretty_assertions::assert_eq;

    fn add_args(len: usize) -> HostArgs {
        let a = HostTensor::new(vec![len], (0..len).map(|i| i as f32).collect());
        let b = HostTensor::new(vec![len], vec![1.0; len]);
        HostArgs(vec![a, b, HostTensor::zeros(vec![len])])
    }

    fn compile(name: &str, config: &Configuration) -> Result<Candidate<HostArgs, ()>, CompileError> {
        HostCompiler::default().compile(&HostCompiler::kernel(name).unwrap(), config)
    }

    #[test_log::test]
    fn tiled_add_is_correct_for_every_configuration() {
        for config in HostCompiler::default_configs(TILED_ADD) {
            let args = add_args(5000);
            compile(TILED_ADD, &config).unwrap().launch(&args).unwrap();

            let expected: Vec<f32> = (0..5000).map(|i| i as f32 + 1.0).collect();
            assert_eq!(args.0[2].to_vec(), expected, "{config}");
        }
    }

    #[test_log::test]
    fn tiled_matmul_is_correct_for_every_configuration() {
        let (m, k, n) = (37, 19, 23);
        let lhs: Vec<f32> = (0..m * k).map(|i| (i % 7) as f32 - 3.0).collect();
        let rhs: Vec<f32> = (0..k * n).map(|i| (i % 5) as f32 - 2.0).collect();
        let mut expected = vec![0.0f32; m * n];
        for row in 0..m {
            for col in 0..n {
                expected[row * n + col] = (0..k).map(|p| lhs[row * k + p] * rhs[p * n + col]).sum();
            }
        }

        for config in HostCompiler::default_configs(TILED_MATMUL) {
            let args = HostArgs(vec![
                HostTensor::new(vec![m, k], lhs.clone()),
                HostTensor::new(vec![k, n], rhs.clone()),
                HostTensor::zeros(vec![m, n]),
            ]);
            compile(TILED_MATMUL, &config).unwrap().launch(&args).unwrap();

            assert_eq!(args.0[2].to_vec(), expected, "{config}");
        }
    }

    #[test_log::test]
    fn oversized_tiles_are_infeasible() {
        let config = Configuration::new(4, 1).param("BLOCK", 1 << 20);

        assert!(matches!(
            compile(TILED_ADD, &config),
            Err(CompileError::Infeasible { .. })
        ));
    }

    #[test_log::test]
    fn aliased_output_is_rejected() {
        let a = HostTensor::zeros(vec![16]);
        let args = HostArgs(vec![a.clone(), HostTensor::zeros(vec![16]), a]);
        let candidate = compile(TILED_ADD, &Configuration::new(1, 1).param("BLOCK", 8)).unwrap();

        assert!(matches!(
            candidate.launch(&args),
            Err(LaunchError::InvalidInputs { .. })
        ));
    }

    #[test_log::test]
    fn clone_mutated_only_copies_mutated_arguments() {
        let args = add_args(8);
        let cloned = args.clone_mutated(&[2]);

        assert!(cloned.0[0].same_buffer(&args.0[0]));
        assert!(!cloned.0[2].same_buffer(&args.0[2]));
    }

    #[test_log::test]
    fn executor_benchmarks_requests() {
        let kernel = HostCompiler::kernel(TILED_ADD).unwrap();
        let request = BenchmarkRequest::new(
            &kernel,
            add_args(4096).describe(),
            Configuration::new(1, 1).param("BLOCK", 1024),
            None,
        );
        let harness = TimingHarness::new(Duration::from_millis(1), Duration::from_millis(2), 20);
        let mut executor = HostExecutor::new(HostCompiler::default(), harness);

        assert!(executor.execute(&request).unwrap().is_finite());
    }

    #[test_log::test]
    fn executor_rejects_unknown_sources() {
        let request = BenchmarkRequest {
            kernel: KernelRef {
                name: TILED_ADD.into(),
                source_hash: "stale".into(),
            },
            args: Vec::new(),
            config: Configuration::new(1, 1).param("BLOCK", 64),
            expected_device: None,
        };
        let mut executor = HostExecutor::new(HostCompiler::default(), TimingHarness::default());

        assert!(executor.execute(&request).is_err());
    }
}
