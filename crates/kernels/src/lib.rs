//! Shared domain types for the kernel configuration planner.

pub mod candidate;
pub mod config;
pub mod decompose;
pub mod dispatch;
pub mod error;
pub mod hardware;
pub mod utils;

pub use candidate::*;
pub use config::*;
pub use decompose::*;
pub use dispatch::*;
pub use error::{PlanError, Result};
pub use hardware::*;
