//! SQLite persistence for the device-local side of sync.

mod entities;
mod metadata;
mod operations;
mod pool;
mod tombstones;

pub use entities::*;
pub use metadata::*;
pub use operations::*;
pub use pool::*;
pub use tombstones::*;
