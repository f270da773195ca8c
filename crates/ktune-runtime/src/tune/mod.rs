mod autotuner;
mod base;
mod candidate;
mod configuration;
mod coordesc;
mod debug;
mod harness;
mod inputs;
mod remote;
mod tune_cache;

pub use autotuner::*;
pub use base::*;
pub use candidate::*;
pub use configuration::*;
pub use coordesc::*;
pub use debug::*;
pub use harness::*;
pub use inputs::*;
pub use remote::*;
pub use tune_cache::*;
