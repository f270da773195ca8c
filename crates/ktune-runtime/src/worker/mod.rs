mod base;
mod pool;
mod process;
mod protocol;
mod request;
mod serve;

pub use base::*;
pub use pool::*;
pub use process::*;
pub use protocol::*;
pub use request::*;
pub use serve::*;
