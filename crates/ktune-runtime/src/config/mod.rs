/// Autotune config module.
pub mod autotune;
/// Worker pool config module.
pub mod worker;

mod base;
mod logger;

pub use base::*;
pub use logger::*;
