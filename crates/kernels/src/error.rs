//! Error types shared by every planner crate.

use crate::hardware::GpuArch;
use thiserror::Error;

/// Errors produced while describing, planning or tuning a workload.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot plan: no valid candidate configuration for {workload}")]
    EmptySearchSpace { workload: String },

    #[error("unsupported architecture family {0:?}")]
    UnsupportedArchitecture(GpuArch),

    #[error("invalid workload: {0}")]
    InvalidWorkload(String),

    #[error("invalid pinned value for `{field}`: {reason}")]
    InvalidPin { field: &'static str, reason: String },

    #[error("approximation table has no entry at index {index} ({section})")]
    MissingApproximation { index: usize, section: String },

    #[error("invalid approximation table: {0}")]
    InvalidTable(String),

    #[error("measurement failed: {0}")]
    Measurement(String),

    #[error("unknown cost model `{0}`")]
    UnknownCostModel(String),

    #[error("malformed kernel descriptor argument: {0}")]
    Descriptor(String),

    #[error("registry i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry format: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PlanError {
    /// Unsupported hardware is a deployment contract; everything else can be
    /// reported back to the caller and retried with different inputs.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PlanError::UnsupportedArchitecture(_))
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, PlanError>;
