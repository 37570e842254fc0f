//! Data models

mod audit;
mod pool;
mod region;
mod workspace;

pub use audit::*;
pub use pool::*;
pub use region::*;
pub use workspace::*;
