use crate::DeviceId;
use serde::{Deserialize, Serialize};

/// Element type of a kernel argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum DType {
    F64,
    F32,
    F16,
    BF16,
    I64,
    I32,
    U8,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::U8 | DType::Bool => 1,
        }
    }
}

/// Metadata of one kernel argument, enough to materialize a representative tensor elsewhere.
#[derive(new, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    /// Shape of the argument.
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: DType,
    /// Device the argument lives on.
    pub device: DeviceId,
    /// Whether the kernel writes to this argument in place.
    pub mutated: bool,
}

impl ArgSpec {
    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of bytes.
    pub fn num_bytes(&self) -> usize {
        self.num_elements() * self.dtype.size()
    }
}

/// Inputs a kernel is benchmarked against.
///
/// Repeated runs of a kernel that writes its arguments in place would benchmark against data
/// corrupted by the previous run, so the harness asks for a fresh copy of the mutated arguments
/// before each run.
pub trait TuneInputs: Clone + Send + 'static {
    /// Returns inputs where every argument listed in `mutated` is a deep copy, and the other
    /// arguments are shared with `self`.
    fn clone_mutated(&self, mutated: &[usize]) -> Self;

    /// Describes every argument. An empty description means the inputs can't cross a process
    /// boundary.
    fn describe(&self) -> Vec<ArgSpec> {
        Vec::new()
    }

    /// Total bytes touched by the kernel, used to report achieved bandwidth.
    fn num_bytes(&self) -> usize {
        self.describe().iter().map(ArgSpec::num_bytes).sum()
    }
}

impl TuneInputs for () {
    fn clone_mutated(&self, _mutated: &[usize]) -> Self {}
}
