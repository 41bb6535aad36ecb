//! Planner facade: configuration, sessions, descriptor parsing and driver.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod session;

#[cfg(feature = "cli")]
pub use cli::*;
pub use config::*;
pub use descriptor::*;
pub use driver::*;
pub use session::*;
