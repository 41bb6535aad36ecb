//! Reference backend: device presets and a host-side kernel executor.

pub mod device;
pub mod runtime;

pub use device::*;
pub use runtime::*;
