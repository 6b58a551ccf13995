//! Data models

mod ids;
mod role;
mod signal;

pub use ids::*;
pub use role::*;
pub use signal::*;
