mod host;
mod probe;

pub use host::*;
pub use probe::*;
