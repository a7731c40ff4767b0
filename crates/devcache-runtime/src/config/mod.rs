/// Allocator config module.
pub mod allocator;

mod base;
mod logger;

pub use base::*;
pub use logger::*;
