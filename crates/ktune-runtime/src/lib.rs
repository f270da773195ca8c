#![warn(missing_docs)]

//! Kernel configuration autotuning engine.
//!
//! A generated kernel can be instantiated with many [configurations](tune::Configuration). The
//! [caching autotuner](tune::CachingAutotuner) compiles a candidate per configuration, benchmarks
//! them (in-process or through an isolated [worker pool](worker::WorkerPool)), optionally refines
//! the winner with [coordinate descent](tune::CoordinateDescentTuner), and remembers the result in
//! a [persistent cache](tune::PersistentCache) so later compilations skip the search.

#[macro_use]
extern crate derive_new;

/// Global configuration and loggers.
pub mod config;

/// Autotune module.
pub mod tune;

/// Isolated benchmark workers.
pub mod worker;

/// Built-in host kernels and probe executors used by the bundled worker binary.
pub mod kernels;

pub use ktune_common::benchmark;
pub use ktune_common::device::{DeviceId, DeviceKind};
