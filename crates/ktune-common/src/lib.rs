#![warn(missing_docs)]

//! Common utilities shared by the ktune crates.

#[macro_use]
extern crate derive_new;

/// Benchmark statistics.
pub mod benchmark;

/// Single-record cache files.
pub mod cache_file;

/// Device identifiers.
pub mod device;

/// Content hashing.
pub mod hash;
