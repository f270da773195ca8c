use core::fmt::Display;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One way to instantiate a kernel: named integer parameters plus two scheduling knobs.
///
/// Configurations are immutable values. Use [Configuration::with] to derive a neighbor.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Configuration {
    // Sorted by name so equal configurations hash and serialize identically.
    params: BTreeMap<String, u32>,
    parallelism_width: u32,
    pipeline_depth: u32,
}

impl Configuration {
    /// Create a configuration without named parameters.
    pub fn new(parallelism_width: u32, pipeline_depth: u32) -> Self {
        Self {
            params: BTreeMap::new(),
            parallelism_width,
            pipeline_depth,
        }
    }

    /// Returns the configuration with the given parameter set.
    pub fn param(mut self, name: impl Into<String>, value: u32) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    /// Returns the configuration with the given parameter removed.
    pub fn without_param(mut self, name: &str) -> Self {
        self.params.remove(name);
        self
    }

    /// The value of a named parameter.
    pub fn get(&self, name: &str) -> Option<u32> {
        self.params.get(name).copied()
    }

    /// Named parameters, ordered by name.
    pub fn params(&self) -> &BTreeMap<String, u32> {
        &self.params
    }

    /// Parallelism width, e.g. the number of warps of a thread group.
    pub fn parallelism_width(&self) -> u32 {
        self.parallelism_width
    }

    /// Pipeline depth, e.g. the number of software pipelining stages.
    pub fn pipeline_depth(&self) -> u32 {
        self.pipeline_depth
    }

    /// Value along the given axis.
    pub fn axis(&self, axis: &Axis) -> Option<u32> {
        match axis {
            Axis::Param(name) => self.get(name),
            Axis::ParallelismWidth => Some(self.parallelism_width),
            Axis::PipelineDepth => Some(self.pipeline_depth),
        }
    }

    /// Returns a copy with the value along `axis` replaced.
    pub fn with(&self, axis: &Axis, value: u32) -> Self {
        let mut config = self.clone();
        match axis {
            Axis::Param(name) => {
                config.params.insert(name.clone(), value);
            }
            Axis::ParallelismWidth => config.parallelism_width = value,
            Axis::PipelineDepth => config.pipeline_depth = value,
        }
        config
    }

    /// Every axis of this configuration: the named parameters first, then the two knobs.
    pub fn axes(&self) -> Vec<Axis> {
        self.params
            .keys()
            .map(|name| Axis::Param(name.clone()))
            .chain([Axis::ParallelismWidth, Axis::PipelineDepth])
            .collect()
    }

    /// Canonical textual form used when hashing a candidate set.
    pub fn canonical(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|(name, value)| format!("('{name}', {value})"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "[{params}] {} {}",
            self.parallelism_width, self.pipeline_depth
        )
    }
}

impl Display for Configuration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (name, value) in self.params.iter() {
            write!(f, "{name}: {value}, ")?;
        }
        write!(
            f,
            "parallelism_width: {}, pipeline_depth: {}",
            self.parallelism_width, self.pipeline_depth
        )
    }
}

/// Drops duplicated configurations, keeping the first occurrence of each.
pub fn unique_configs(configs: Vec<Configuration>) -> Vec<Configuration> {
    let mut seen = BTreeSet::new();
    configs
        .into_iter()
        .filter(|config| seen.insert(config.clone()))
        .collect()
}

/// A tunable dimension of a [Configuration].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    /// A named parameter, such as a block size.
    Param(String),
    /// The parallelism width knob.
    ParallelismWidth,
    /// The pipeline depth knob.
    PipelineDepth,
}

impl Display for Axis {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Axis::Param(name) => f.write_str(name),
            Axis::ParallelismWidth => f.write_str("parallelism_width"),
            Axis::PipelineDepth => f.write_str("pipeline_depth"),
        }
    }
}

/// How a value moves by one step along an axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepRule {
    /// Multiply or divide by `factor`, for block-size-like parameters.
    Scale {
        /// The scaling factor, at least 2.
        factor: u32,
    },
    /// Add or subtract `delta`, for stage-like parameters.
    Offset {
        /// The offset, at least 1.
        delta: u32,
    },
}

impl StepRule {
    /// Values reachable in `1..=radius` steps from `value`, all at least 1, excluding `value`.
    pub fn neighbours(&self, value: u32, radius: u32) -> Vec<u32> {
        let mut values = BTreeSet::new();
        let (mut up, mut down) = (Some(value), Some(value));

        for _ in 0..radius {
            let (next_up, next_down) = match *self {
                StepRule::Scale { factor } => {
                    let factor = factor.max(2);
                    (
                        up.and_then(|v| v.checked_mul(factor)),
                        down.and_then(|v| (v / factor >= 1).then_some(v / factor)),
                    )
                }
                StepRule::Offset { delta } => {
                    let delta = delta.max(1);
                    (
                        up.and_then(|v| v.checked_add(delta)),
                        down.and_then(|v| v.checked_sub(delta).filter(|v| *v >= 1)),
                    )
                }
            };
            up = next_up;
            down = next_down;
            values.extend(up);
            values.extend(down);
        }

        values.remove(&value);
        values.into_iter().collect()
    }

    fn canonical(&self) -> String {
        match self {
            StepRule::Scale { factor } => format!("*{factor}"),
            StepRule::Offset { delta } => format!("+{delta}"),
        }
    }
}

/// The search space explored around a configuration: step rules, bounds and frozen axes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    param_step: StepRule,
    param_max: u32,
    parallelism_width_max: u32,
    pipeline_depth_max: u32,
    steps: BTreeMap<Axis, StepRule>,
    bounds: BTreeMap<Axis, u32>,
    frozen: BTreeSet<Axis>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            param_step: StepRule::Scale { factor: 2 },
            param_max: 4096,
            parallelism_width_max: 32,
            pipeline_depth_max: 8,
            steps: BTreeMap::new(),
            bounds: BTreeMap::new(),
            frozen: BTreeSet::new(),
        }
    }
}

impl SearchSpace {
    /// Override the step rule of an axis.
    pub fn with_step(mut self, axis: Axis, rule: StepRule) -> Self {
        self.steps.insert(axis, rule);
        self
    }

    /// Override the inclusive upper bound of an axis.
    pub fn with_bound(mut self, axis: Axis, max: u32) -> Self {
        self.bounds.insert(axis, max);
        self
    }

    /// Exclude an axis from the search.
    pub fn freeze(mut self, axis: Axis) -> Self {
        self.frozen.insert(axis);
        self
    }

    /// Whether an axis is searched.
    pub fn is_frozen(&self, axis: &Axis) -> bool {
        self.frozen.contains(axis)
    }

    /// The step rule used along an axis.
    pub fn step(&self, axis: &Axis) -> StepRule {
        if let Some(rule) = self.steps.get(axis) {
            return *rule;
        }

        match axis {
            Axis::Param(_) => self.param_step,
            Axis::ParallelismWidth => StepRule::Scale { factor: 2 },
            Axis::PipelineDepth => StepRule::Offset { delta: 1 },
        }
    }

    /// The inclusive upper bound of an axis.
    pub fn bound(&self, axis: &Axis) -> u32 {
        if let Some(max) = self.bounds.get(axis) {
            return *max;
        }

        match axis {
            Axis::Param(_) => self.param_max,
            Axis::ParallelismWidth => self.parallelism_width_max,
            Axis::PipelineDepth => self.pipeline_depth_max,
        }
    }

    /// Whether every axis of the configuration is within its bound.
    pub fn within_bounds(&self, config: &Configuration) -> bool {
        config
            .axes()
            .iter()
            .all(|axis| config.axis(axis).is_none_or(|value| value <= self.bound(axis)))
    }

    /// Canonical textual form used when hashing a candidate set.
    ///
    /// Only the rules that apply to the given axes are included, so unrelated overrides don't
    /// invalidate cached results.
    pub fn canonical(&self, axes: &BTreeSet<Axis>) -> String {
        axes.iter()
            .map(|axis| {
                let frozen = if self.is_frozen(axis) { " frozen" } else { "" };
                format!(
                    "{axis} {} <={}{frozen}",
                    self.step(axis).canonical(),
                    self.bound(axis)
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}
