//! Measurement-driven tuning and the persistent plan registry.

pub mod cache;
pub mod tuner;

pub use cache::*;
pub use tuner::*;
